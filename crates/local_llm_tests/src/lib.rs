//! Test harness for [`local_llm`].
//!
//! The tests run against [`stub::StubBackend`], a scripted byte-level backend which records
//! every call made to it, so decode order, positions and locking can be checked exactly. Set
//! `RUST_LOG` to see the library's logs while the tests run.

pub mod stub;

#[cfg(test)]
mod tests;
