pub mod config;
pub mod dataplane;
pub mod routing;
pub mod test_util;

pub use config::RouterConfig;
pub use dataplane::router::{ChannelSink, EmittedFrame, FrameSink, Router, RouterError, SinkError};
