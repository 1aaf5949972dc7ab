pub mod csr;
pub mod identity;
pub mod patcher;
pub mod provision;
pub mod store;
pub mod trust_anchor;
pub mod utils;
pub mod writer;

#[cfg(test)]
mod test_utils;
