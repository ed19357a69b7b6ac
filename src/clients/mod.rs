pub mod registry;

pub use registry::{ClientHandle, ClientRegistry, Unregistered};
