mod dispatcher;
mod registers;
mod stats;
mod store;

pub use dispatcher::{Access, Dispatcher, RequestHandler};
pub use store::RegisterStore;
