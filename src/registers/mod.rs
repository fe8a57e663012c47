pub mod address_space;
pub mod store;

pub use address_space::RegisterAddressSpace;
pub use store::RegisterStore;
