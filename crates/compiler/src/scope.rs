//! Lexical scope tree.
//!
//! Scopes form a tree rooted at the universal scope that holds built-ins and
//! all modules. Each scope maps interned identifiers to entity handles;
//! iteration order is insertion order so diagnostics are reproducible.
//!
//! `NoScope` scopes bound the visibility of attributes (`@a { ... }`) and
//! host `#foreach`/template instance bindings without introducing a name
//! *registration* level: declarations made under one register into the
//! nearest enclosing real scope, while lookups still see names bound
//! directly in the `NoScope` itself.

use crate::ast::AstIndex;
use crate::interner::Ident;
use indexmap::IndexMap;

/// Handle to a scope. Zero is reserved for "no scope".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScopeId(pub u32);

impl ScopeId {
    pub const NONE: ScopeId = ScopeId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Member,
    Local,
    NoScope,
}

#[derive(Debug)]
pub struct Scope {
    pub kind: ScopeKind,
    pub parent: ScopeId,
    /// Declaration that owns this scope (struct, function, module), if any.
    pub owner: AstIndex,
    pub debug_name: String,
    pub symbols: IndexMap<Ident, AstIndex>,
    /// Module scopes searched after this scope's own symbols (`import`).
    pub imports: Vec<ScopeId>,
}

impl Scope {
    pub fn new(kind: ScopeKind, parent: ScopeId, owner: AstIndex, debug_name: impl Into<String>) -> Self {
        Scope {
            kind,
            parent,
            owner,
            debug_name: debug_name.into(),
            symbols: IndexMap::new(),
            imports: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbols_keep_insertion_order() {
        let mut scope = Scope::new(ScopeKind::Global, ScopeId::NONE, AstIndex::UNDEF, "test");
        scope.symbols.insert(Ident(20), AstIndex(1));
        scope.symbols.insert(Ident(5), AstIndex(2));
        scope.symbols.insert(Ident(12), AstIndex(3));
        let order: Vec<u32> = scope.symbols.keys().map(|i| i.0).collect();
        assert_eq!(order, vec![20, 5, 12]);
    }
}
