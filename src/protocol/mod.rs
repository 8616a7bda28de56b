pub mod http1;
pub mod response;

pub use http1::{CheckState, HttpCode, LineStatus, Method, ReadBuf, RequestHead, RequestParser};
pub use response::ResponseBuf;
