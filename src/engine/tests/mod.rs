pub mod helpers;
mod tests_mutations;
