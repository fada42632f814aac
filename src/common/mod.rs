pub mod data;
pub mod http;
pub mod serialization;
pub mod util;
