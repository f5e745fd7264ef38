// Session-local interning of key expressions into numeric ids.
use crate::core::error::{Error, ErrorKind};
use crate::core::keyexpr::KeyExpr;
use std::collections::HashMap;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ExprId(u64);

impl ExprId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ids start at 1 and are never handed out twice, even after undeclare.
/// Declaring the same string twice yields two distinct ids.
#[derive(Debug)]
pub struct KeyExprTable {
    next_id: u64,
    entries: HashMap<ExprId, KeyExpr>,
}

impl KeyExprTable {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    pub fn declare(&mut self, expr: &str) -> Result<ExprId, Error> {
        let expr = KeyExpr::new(expr)?;
        self.declare_expr(expr)
    }

    pub fn declare_expr(&mut self, expr: KeyExpr) -> Result<ExprId, Error> {
        let id = ExprId(self.next_id);
        self.next_id = self.next_id.checked_add(1).ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("key expression id space exhausted")
        })?;
        self.entries.insert(id, expr);
        Ok(id)
    }

    pub fn undeclare(&mut self, id: ExprId) -> Result<KeyExpr, Error> {
        self.entries.remove(&id).ok_or_else(|| unknown_id(id))
    }

    pub fn resolve(&self, id: ExprId) -> Result<&KeyExpr, Error> {
        self.entries.get(&id).ok_or_else(|| unknown_id(id))
    }

    pub fn contains(&self, id: ExprId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> Vec<(ExprId, KeyExpr)> {
        let mut entries: Vec<_> = self.entries.drain().collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }
}

impl Default for KeyExprTable {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_id(id: ExprId) -> Error {
    Error::new(ErrorKind::UnknownId)
        .with_message("key expression id is not declared")
        .with_id(id.get())
}
