pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod event;
pub mod hub;
pub mod relay;
pub mod server;
pub mod session;

pub use client::{Client, ClientObserver, ClientRegistry, SessionSource};
pub use codec::{format_command, next_transaction_id, parse_chunk, CommandArgs, Element, Packet};
pub use error::{Error, Result};
pub use event::{SessionEvent, SessionState, Status};
pub use hub::ProxyHub;
pub use server::DbgpProxyServer;
pub use session::{parse_ide_key, CommandResponse, Session, SessionOptions};

#[cfg(test)]
mod tests {
    #[test]
    fn it_works() {
        let result = 2 + 2;
        assert_eq!(result, 4);
    }
}
