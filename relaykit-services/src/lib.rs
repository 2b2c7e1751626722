pub mod rest;
pub mod tasks;
pub mod transport;

pub use rest::{
    registry::ReplyRegistry, DefaultReplyProcessor, ReplyProcessor, RestApi, RestApiReply,
};
pub use tasks::TaskPool;
pub use transport::{client::HttpTransport, OutboundRequest, RawReply, RawReplyRef, Transport};
