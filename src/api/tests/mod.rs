pub mod helpers;
mod tests_write;
