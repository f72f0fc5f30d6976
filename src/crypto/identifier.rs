//! Visitor identifier normalization.
//!
//! The identifier mixed into every passage hash is derived from the visitor's
//! User-Agent. Some stacks append a bracketed qualifier (`Foo/1.0 [FBAN/...]`)
//! that is not stable between the queue server and the protected site, so it
//! is cut off before hashing.

/// A `[` before this character offset is part of the identifier proper.
pub const QUALIFIER_MIN_OFFSET: usize = 20;

/// Strip a trailing bracketed qualifier from a visitor identifier.
///
/// Everything from the first `[` onward is removed, unless that `[` starts
/// before character 20, in which case the identifier is returned verbatim.
pub fn process_identifier(identifier: &str) -> &str {
    match identifier.find('[') {
        Some(pos) if identifier[..pos].chars().count() >= QUALIFIER_MIN_OFFSET => {
            &identifier[..pos]
        }
        _ => identifier,
    }
}
