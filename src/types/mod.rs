pub mod ids;
pub mod request;

pub use ids::{ItemId, RequestId, WorkerId};
pub use request::{BufferItem, FetchParams, RequestSpec};
