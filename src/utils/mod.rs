pub mod auth;
pub mod ids;
#[cfg(test)]
pub mod test_utils;
pub mod url;
