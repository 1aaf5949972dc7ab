pub mod pem;
pub mod refs;
