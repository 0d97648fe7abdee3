pub mod error;
pub mod frame;
pub mod requests;
pub mod responses;


pub use error::{ImrpcError, Result, DEADLINE_MESSAGE, ONEWAY_MESSAGE};
pub use frame::{Preamble, DEFAULT_MAX_FRAME_SIZE, PREAMBLE_LEN, PROTOCOL_VERSION};
pub use requests::{Request, RequestId, META_DEADLINE, META_ONEWAY};
pub use responses::Response;
