// Key-expression validation and wildcard intersection.
use crate::core::error::{Error, ErrorKind};
use std::fmt;
use std::sync::Arc;

const SEPARATOR: char = '/';
const SINGLE_WILD: &str = "*";
const MULTI_WILD: &str = "**";
const FORBIDDEN: [char; 3] = ['?', '#', '$'];

/// Borrowed, validated view of a key expression.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct KeyExprRef<'a>(&'a str);

/// Owned key expression; clones share the underlying string.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
pub struct KeyExpr(Arc<str>);

impl<'a> KeyExprRef<'a> {
    pub fn new(expr: &'a str) -> Result<Self, Error> {
        validate(expr)?;
        Ok(Self(expr))
    }

    pub fn as_str(&self) -> &'a str {
        self.0
    }

    pub fn is_absolute(&self) -> bool {
        self.0.starts_with(SEPARATOR)
    }

    pub fn is_wild(&self) -> bool {
        self.0.contains('*')
    }

    pub fn intersects(&self, other: KeyExprRef<'_>) -> bool {
        if self.is_absolute() != other.is_absolute() {
            return false;
        }
        let left: Vec<&str> = chunks(self.0).collect();
        let right: Vec<&str> = chunks(other.0).collect();
        chunks_intersect(&left, &right)
    }

    pub fn to_owned(&self) -> KeyExpr {
        KeyExpr(Arc::from(self.0))
    }
}

impl KeyExpr {
    pub fn new(expr: impl Into<String>) -> Result<Self, Error> {
        let expr = expr.into();
        validate(&expr)?;
        Ok(Self(Arc::from(expr)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_view(&self) -> KeyExprRef<'_> {
        KeyExprRef(&self.0)
    }

    pub fn intersects(&self, other: &KeyExpr) -> bool {
        self.as_view().intersects(other.as_view())
    }

    pub fn is_wild(&self) -> bool {
        self.as_view().is_wild()
    }
}

impl fmt::Display for KeyExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for KeyExprRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl AsRef<str> for KeyExpr {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for KeyExpr {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        KeyExpr::new(value)
    }
}

impl TryFrom<String> for KeyExpr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        KeyExpr::new(value)
    }
}

impl std::str::FromStr for KeyExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyExpr::new(s)
    }
}

pub fn validate(expr: &str) -> Result<(), Error> {
    let invalid = |message: &str| {
        Err(Error::new(ErrorKind::InvalidExpression)
            .with_message(message.to_string())
            .with_key_expr(expr))
    };

    if expr.is_empty() {
        return invalid("key expression is empty");
    }
    if expr.contains(FORBIDDEN) {
        return invalid("key expression contains a reserved character ('?', '#' or '$')");
    }
    let body = expr.strip_prefix(SEPARATOR).unwrap_or(expr);
    if body.is_empty() {
        return invalid("key expression has no chunks");
    }

    let mut previous_multi = false;
    for chunk in body.split(SEPARATOR) {
        if chunk.is_empty() {
            return invalid("key expression contains an empty chunk");
        }
        if chunk.contains('*') && chunk != SINGLE_WILD && chunk != MULTI_WILD {
            return invalid("wildcards must span a whole chunk");
        }
        let is_multi = chunk == MULTI_WILD;
        if is_multi && previous_multi {
            return invalid("'**/**' is not canonical; use '**'");
        }
        previous_multi = is_multi;
    }
    Ok(())
}

fn chunks(expr: &str) -> impl Iterator<Item = &str> {
    expr.strip_prefix(SEPARATOR).unwrap_or(expr).split(SEPARATOR)
}

/// `reach[i * width + j]` holds whether `left[i..]` and `right[j..]` intersect.
fn chunks_intersect(left: &[&str], right: &[&str]) -> bool {
    let width = right.len() + 1;
    let mut reach = vec![false; (left.len() + 1) * width];
    for i in (0..=left.len()).rev() {
        for j in (0..=right.len()).rev() {
            let at = |i: usize, j: usize| reach[i * width + j];
            let value = match (left.get(i), right.get(j)) {
                (None, None) => true,
                (Some(&MULTI_WILD), _) => at(i + 1, j) || (j < right.len() && at(i, j + 1)),
                (_, Some(&MULTI_WILD)) => at(i, j + 1) || (i < left.len() && at(i + 1, j)),
                (Some(a), Some(b)) => chunk_intersects(a, b) && at(i + 1, j + 1),
                _ => false,
            };
            reach[i * width + j] = value;
        }
    }
    reach[0]
}

fn chunk_intersects(a: &str, b: &str) -> bool {
    a == SINGLE_WILD || b == SINGLE_WILD || a == b
}

#[cfg(test)]
mod tests {
    use super::{KeyExpr, KeyExprRef, validate};
    use crate::core::error::ErrorKind;
    use std::time::{Duration, Instant};

    fn ke(expr: &str) -> KeyExpr {
        KeyExpr::new(expr).expect("valid key expression")
    }

    #[test]
    fn accepts_plain_and_wildcard_forms() {
        for expr in [
            "test/key",
            "/demo/example",
            "/demo/example/keyplane-pub",
            "a/*/c",
            "a/**",
            "**",
            "*",
            "a/**/c/*",
            "with space/ok",
        ] {
            validate(expr).unwrap_or_else(|err| panic!("{expr}: {err}"));
        }
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in [
            "", "/", "a//b", "a/", "//a", "a/b*", "a/**/**", "a?x=1", "a#b", "a/$*",
        ] {
            let err = validate(expr).expect_err(expr);
            assert_eq!(err.kind(), ErrorKind::InvalidExpression, "{expr}");
            assert_eq!(err.key_expr(), Some(expr));
        }
    }

    #[test]
    fn exact_expressions_intersect_only_themselves() {
        assert!(ke("a/b").intersects(&ke("a/b")));
        assert!(!ke("a/b").intersects(&ke("a/c")));
        assert!(!ke("a/b").intersects(&ke("a/b/c")));
    }

    #[test]
    fn single_wildcard_matches_one_chunk() {
        assert!(ke("a/*").intersects(&ke("a/b")));
        assert!(!ke("a/*").intersects(&ke("a/b/c")));
        assert!(!ke("a/*").intersects(&ke("a")));
        assert!(ke("*/b").intersects(&ke("a/*")));
    }

    #[test]
    fn multi_wildcard_matches_zero_or_more_chunks() {
        assert!(ke("a/**").intersects(&ke("a")));
        assert!(ke("a/**").intersects(&ke("a/b/c/d")));
        assert!(ke("a/**/d").intersects(&ke("a/b/c/d")));
        assert!(!ke("a/**/d").intersects(&ke("a/b/c/e")));
        assert!(ke("**").intersects(&ke("x/y")));
        assert!(ke("a/**/c").intersects(&ke("a/*/**")));
    }

    #[test]
    fn many_multi_wildcards_stay_cheap() {
        let pattern = format!("{}b", "**/a/".repeat(24));
        let miss = vec!["a"; 60].join("/");
        let hit = format!("{miss}/b");
        let started = Instant::now();
        assert!(!ke(&pattern).intersects(&ke(&miss)));
        assert!(ke(&pattern).intersects(&ke(&hit)));
        assert!(ke(&hit).intersects(&ke(&pattern)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn absolute_and_relative_do_not_intersect() {
        assert!(ke("/demo/example").intersects(&ke("/demo/*")));
        assert!(!ke("/demo/example").intersects(&ke("demo/example")));
    }

    #[test]
    fn view_round_trips_to_owned() {
        let view = KeyExprRef::new("test/key").expect("view");
        assert!(!view.is_wild());
        assert_eq!(view.to_owned(), ke("test/key"));
        assert_eq!(ke("a/*").as_view().to_string(), "a/*");
        assert!(ke("a/*").is_wild());
    }
}
