use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::protocol::{FrameHeader, MbapHeader, ModbusFrame, MAX_PDU_LEN, MBAP_HEADER_LEN};
use crate::utils::error::ServerError;

pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    let poly: u16 = 0xA001;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Read one Modbus TCP frame. Returns `Ok(None)` when the peer closed the
/// stream cleanly before sending another header. The protocol ID is kept
/// as sent so the reply can echo it.
pub async fn read_tcp_frame<R>(reader: &mut R) -> Result<Option<ModbusFrame>, ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; MBAP_HEADER_LEN];
    let mut filled = 0;
    while filled < MBAP_HEADER_LEN {
        let n = reader.read(&mut header_bytes[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ServerError::Protocol("Connection closed mid-header".to_string()));
        }
        filled += n;
    }

    let header = MbapHeader::from_bytes(&header_bytes);
    let pdu_len = header.length as usize;
    if pdu_len < 2 || pdu_len - 1 > MAX_PDU_LEN {
        return Err(ServerError::Protocol(format!("Invalid MBAP length {}", header.length)));
    }

    let mut pdu = vec![0u8; pdu_len - 1];
    reader.read_exact(&mut pdu).await?;

    Ok(Some(ModbusFrame {
        header: FrameHeader::Tcp(header),
        pdu,
    }))
}

pub async fn write_frame<W>(writer: &mut W, frame: &ModbusFrame) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Split an RTU frame (`unit | PDU | CRC16-LE`) after checking its CRC.
pub fn decode_rtu_frame(bytes: &[u8]) -> Result<ModbusFrame, ServerError> {
    if bytes.len() < 4 {
        return Err(ServerError::Protocol(format!("RTU frame too short: {} bytes", bytes.len())));
    }
    let data_len = bytes.len() - 2;
    let received = u16::from_le_bytes([bytes[data_len], bytes[data_len + 1]]);
    let calculated = crc16_modbus(&bytes[..data_len]);
    if received != calculated {
        return Err(ServerError::Protocol(format!(
            "CRC mismatch: received 0x{:04X}, calculated 0x{:04X}",
            received, calculated
        )));
    }
    Ok(ModbusFrame::headless(bytes[0], bytes[1..data_len].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_modbus() {
        // read 1 holding register at 0 from unit 1
        let data = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(crc16_modbus(&data), 0x0A84);
    }

    #[test]
    fn test_rtu_frame_round_trip() {
        let frame = ModbusFrame::headless(1, vec![0x03, 0x00, 0x00, 0x00, 0x01]);
        let bytes = frame.to_bytes();
        assert_eq!(bytes, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
        assert_eq!(decode_rtu_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_rtu_frame_bad_crc() {
        let bytes = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0B];
        assert!(matches!(decode_rtu_frame(&bytes), Err(ServerError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_read_tcp_frame() {
        let bytes: Vec<u8> = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];
        let mut reader = &bytes[..];
        let frame = read_tcp_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(frame.unit_id(), 0x11);
        assert_eq!(frame.pdu, vec![0x03, 0x00, 0x6B, 0x00, 0x03]);
        assert!(read_tcp_frame(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reply_echoes_protocol_id() {
        let bytes: Vec<u8> = vec![0x12, 0x34, 0x00, 0x07, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        let mut reader = &bytes[..];
        let frame = read_tcp_frame(&mut reader).await.unwrap().unwrap();
        let reply = frame.reply(vec![0x03, 0x02, 0x00, 0x00]);
        assert_eq!(
            reply.to_bytes(),
            vec![0x12, 0x34, 0x00, 0x07, 0x00, 0x05, 0x01, 0x03, 0x02, 0x00, 0x00]
        );
    }

    #[tokio::test]
    async fn test_read_tcp_frame_rejects_bad_length() {
        let bytes: Vec<u8> = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x11];
        let mut reader = &bytes[..];
        assert!(read_tcp_frame(&mut reader).await.is_err());
    }
}
