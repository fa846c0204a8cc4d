//! Default quoting for identifiers and literals.
//!
//! These follow the quoting rules shared by PostgreSQL and SQLite; engines
//! with different rules (e.g. MySQL backtick identifiers) override the
//! relevant [`EngineProvider`](crate::EngineProvider) methods.

/// Quote an identifier, such as a table name, for usage in a query.
///
/// The identifier is truncated at the first NUL byte and embedded double
/// quotes are escaped by doubling.
pub fn quote_identifier(name: &str) -> String {
    let name = match name.find('\u{0}') {
        Some(end) => &name[..end],
        None => name,
    };
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a literal, such as `2023-01-05 15:00:00Z`, for usage in a query.
///
/// Embedded single quotes are escaped by doubling. When the literal contains
/// a backslash, backslashes are doubled as well and the literal is rendered
/// with the `E''` escape-string syntax (with a leading space so it can be
/// spliced directly after a keyword).
pub fn quote_literal(literal: &str) -> String {
    let literal = literal.replace('\'', "''");
    if literal.contains('\\') {
        format!(" E'{}'", literal.replace('\\', "\\\\"))
    } else {
        format!("'{literal}'")
    }
}
