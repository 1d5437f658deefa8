#[macro_use]
pub(crate) mod boilerplate;

/// Provide interoperability with C return values.
pub(crate) mod interop;
