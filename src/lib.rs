pub type Result<T> = std::result::Result<T, std::io::Error>;

pub mod dispatch;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
