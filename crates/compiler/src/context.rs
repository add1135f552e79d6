//! The compilation context.
//!
//! One value owns every arena of a compiler invocation: source files and the
//! shared token buffer, the AST node arena and item-list pool, the interner,
//! the scope tree, diagnostics, the analysis driver's in-progress stack, and
//! the IR store. There are no hidden singletons; every pass receives
//! `&mut CompilationContext`.

use std::collections::HashMap;

use crate::arena::{Pool, PoolSlice};
use crate::ast::{
    flags, AstData, AstIndex, AstKind, AstNode, AstState, AttrInfo, BasicType, BuiltinFn, Prop,
    PropState,
};
use crate::config::CompilerConfig;
use crate::errors::{DiagKind, Diagnostics, Fatal, SourceLoc};
use crate::interner::{known, Ident, Interner};
use crate::ir::IrStore;
use crate::lexer::{self, TokenBuffer};
use crate::scope::{Scope, ScopeId, ScopeKind};
use indexmap::IndexMap;

/// One input file and the index of its first token in the shared buffer.
#[derive(Debug)]
pub struct SourceFile {
    pub name: String,
    pub source: String,
    pub first_token: u32,
    pub module: AstIndex,
}

/// Nodes created once per compilation and shared by reference: the error
/// sentinel and one node per basic type.
#[derive(Debug)]
pub struct CommonNodes {
    pub error_node: AstIndex,
    pub basic: [AstIndex; BasicType::COUNT],
    /// `u8[]`, the type of string literals.
    pub u8_slice: AstIndex,
}

#[derive(Debug)]
pub struct CompilationContext {
    pub config: CompilerConfig,
    pub interner: Interner,
    pub files: Vec<SourceFile>,
    pub tokens: TokenBuffer,

    pub nodes: Vec<AstNode>,
    pub arrays: Pool<AstIndex>,
    pub attr_infos: Vec<AttrInfo>,
    /// Decoded string-literal values.
    pub strings: Vec<String>,

    pub scopes: Vec<Scope>,
    pub root_scope: ScopeId,

    pub modules: Vec<AstIndex>,
    pub module_paths: IndexMap<Ident, AstIndex>,
    /// Every function declaration, in parse order, for the IR-gen sweep.
    pub all_functions: Vec<AstIndex>,

    pub diagnostics: Diagnostics,
    /// In-progress (node, property) computations, for cycle detection.
    pub analysis_stack: Vec<(AstIndex, Prop)>,

    /// Computed type per node, parallel to `nodes`. `UNDEF` = not computed.
    node_types: Vec<AstIndex>,
    /// Evaluated values of enum members and manifest constants.
    pub enum_values: HashMap<AstIndex, i64>,
    /// Template instances keyed by (declaration, argument nodes).
    pub template_instances: HashMap<(AstIndex, Vec<AstIndex>), AstIndex>,

    pub common: CommonNodes,
    pub ir: IrStore,
}

impl CompilationContext {
    pub fn new(config: CompilerConfig) -> Self {
        let mut ctx = CompilationContext {
            config,
            interner: Interner::new(),
            files: Vec::new(),
            tokens: TokenBuffer::new(),
            nodes: Vec::new(),
            arrays: Pool::new(),
            attr_infos: vec![AttrInfo::default()],
            strings: Vec::new(),
            scopes: vec![Scope::new(ScopeKind::NoScope, ScopeId::NONE, AstIndex::UNDEF, "<none>")],
            root_scope: ScopeId::NONE,
            modules: Vec::new(),
            module_paths: IndexMap::new(),
            all_functions: Vec::new(),
            diagnostics: Diagnostics::new(),
            analysis_stack: Vec::new(),
            node_types: Vec::new(),
            enum_values: HashMap::new(),
            template_instances: HashMap::new(),
            common: CommonNodes {
                error_node: AstIndex::UNDEF,
                basic: [AstIndex::UNDEF; BasicType::COUNT],
                u8_slice: AstIndex::UNDEF,
            },
            ir: IrStore::new(),
        };

        // slot 0 is the reserved "undefined" handle; never dereferenced
        ctx.nodes.push(AstNode::new(SourceLoc::default(), AstData::ErrorNode));

        ctx.common.error_node = ctx.add_node(SourceLoc::default(), AstData::ErrorNode);
        ctx.root_scope = ctx.new_scope(ScopeKind::Global, ScopeId::NONE, AstIndex::UNDEF, "<root>");
        ctx.create_common_nodes();
        ctx.register_builtins();
        ctx.register_defines();
        ctx
    }

    fn create_common_nodes(&mut self) {
        for i in 0..BasicType::COUNT {
            // BasicType is dense, so the count covers every discriminant
            let basic = match i as u8 {
                0 => BasicType::Noreturn,
                1 => BasicType::Void,
                2 => BasicType::Bool,
                3 => BasicType::Null,
                4 => BasicType::I8,
                5 => BasicType::I16,
                6 => BasicType::I32,
                7 => BasicType::I64,
                8 => BasicType::U8,
                9 => BasicType::U16,
                10 => BasicType::U32,
                11 => BasicType::U64,
                12 => BasicType::F32,
                13 => BasicType::F64,
                14 => BasicType::Alias,
                15 => BasicType::Type,
                _ => unreachable!(),
            };
            let node = self.add_node(SourceLoc::default(), AstData::TypeBasic { basic });
            self.node_mut(node).set_flag(flags::IS_TYPE);
            self.mark_fully_analyzed(node);
            self.common.basic[i] = node;

            // the nameable ones resolve through the root scope
            if BasicType::from_name(basic.name()).is_some() {
                let id = self.interner.get_or_intern(basic.name());
                self.scopes[self.root_scope.0 as usize].symbols.insert(id, node);
            }
        }

        let u8_node = self.basic_type(BasicType::U8);
        let u8_slice = self.add_node(SourceLoc::default(), AstData::TypeSlice { element: u8_node });
        self.node_mut(u8_slice).set_flag(flags::IS_TYPE);
        self.mark_fully_analyzed(u8_slice);
        self.common.u8_slice = u8_slice;
    }

    fn register_builtins(&mut self) {
        let builtins = [(known::SIZE_OF, BuiltinFn::SizeOf), (known::ALIGN_OF, BuiltinFn::AlignOf)];
        for (id, func) in builtins {
            let node = self.add_node(SourceLoc::default(), AstData::BuiltinFunc { func });
            self.mark_fully_analyzed(node);
            self.scopes[self.root_scope.0 as usize].symbols.insert(id, node);
        }
    }

    /// Config defines become manifest constants in the root scope, visible
    /// to `#if` conditions and ordinary code alike.
    fn register_defines(&mut self) {
        let defines: Vec<(String, i64)> =
            self.config.defines.iter().map(|(k, &v)| (k.clone(), v)).collect();
        for (name, value) in defines {
            let id = self.interner.get_or_intern(&name);
            let i64_type = self.basic_type(BasicType::I64);
            let value_node =
                self.add_node(SourceLoc::default(), AstData::IntLiteral { value: value as u64 });
            self.set_type(value_node, i64_type);
            self.mark_fully_analyzed(value_node);
            let member = self.add_node(
                SourceLoc::default(),
                AstData::EnumMember {
                    name: id,
                    parent_scope: self.root_scope,
                    ty: i64_type,
                    value: value_node,
                },
            );
            self.set_type(member, i64_type);
            self.mark_fully_analyzed(member);
            self.enum_values.insert(member, value);
            self.scopes[self.root_scope.0 as usize].symbols.insert(id, member);
        }
    }

    fn mark_fully_analyzed(&mut self, node: AstIndex) {
        let n = self.node_mut(node);
        n.advance_state(AstState::TypeCheckDone);
        for prop in [Prop::RegisterSelf, Prop::RegisterNested, Prop::NameResolve, Prop::TypeCheck] {
            n.set_prop_state(prop, PropState::Calculated);
        }
    }

    // ---- nodes ----

    pub fn add_node(&mut self, loc: SourceLoc, data: AstData) -> AstIndex {
        let index = AstIndex(self.nodes.len() as u32);
        self.nodes.push(AstNode::new(loc, data));
        index
    }

    pub fn node(&self, index: AstIndex) -> &AstNode {
        debug_assert!(index.is_defined(), "dereferencing the undefined AST handle");
        &self.nodes[index.0 as usize]
    }

    pub fn node_mut(&mut self, index: AstIndex) -> &mut AstNode {
        debug_assert!(index.is_defined(), "dereferencing the undefined AST handle");
        &mut self.nodes[index.0 as usize]
    }

    pub fn kind_of(&self, index: AstIndex) -> AstKind {
        self.node(index).kind()
    }

    pub fn basic_type(&self, basic: BasicType) -> AstIndex {
        self.common.basic[basic as usize]
    }

    /// Copy of an item list; avoids holding a pool borrow across mutation.
    pub fn list(&self, slice: PoolSlice) -> Vec<AstIndex> {
        self.arrays.get(slice).to_vec()
    }

    // ---- computed types ----

    pub fn set_type(&mut self, node: AstIndex, ty: AstIndex) {
        let i = node.0 as usize;
        if self.node_types.len() <= i {
            self.node_types.resize(i + 1, AstIndex::UNDEF);
        }
        self.node_types[i] = ty;
    }

    pub fn get_type(&self, node: AstIndex) -> AstIndex {
        self.node_types.get(node.0 as usize).copied().unwrap_or(AstIndex::UNDEF)
    }

    // ---- strings & attributes ----

    pub fn add_string(&mut self, value: String) -> u32 {
        let index = self.strings.len() as u32;
        self.strings.push(value);
        index
    }

    /// Store an attribute-info block; returns the value for `node.attr_info`.
    pub fn add_attr_info(&mut self, info: AttrInfo) -> u32 {
        self.attr_infos.push(info);
        (self.attr_infos.len() - 1) as u32
    }

    pub fn attr_info(&self, node: AstIndex) -> Option<&AttrInfo> {
        let slot = self.node(node).attr_info;
        if slot == 0 { None } else { Some(&self.attr_infos[slot as usize]) }
    }

    // ---- scopes ----

    pub fn new_scope(
        &mut self,
        kind: ScopeKind,
        parent: ScopeId,
        owner: AstIndex,
        debug_name: impl Into<String>,
    ) -> ScopeId {
        let id = ScopeId(self.scopes.len() as u32);
        self.scopes.push(Scope::new(kind, parent, owner, debug_name));
        id
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn scope_mut(&mut self, id: ScopeId) -> &mut Scope {
        &mut self.scopes[id.0 as usize]
    }

    /// Register a declared name. Registration is transparent to `NoScope`
    /// scopes: it lands in the nearest enclosing real scope. A duplicate
    /// name reports a diagnostic citing the first declaration and keeps it.
    pub fn insert_symbol(&mut self, scope: ScopeId, name: Ident, decl: AstIndex) {
        let mut target = scope;
        while self.scope(target).kind == ScopeKind::NoScope {
            let parent = self.scope(target).parent;
            if parent.is_none() {
                break;
            }
            target = parent;
        }
        if let Some(&first) = self.scope(target).symbols.get(&name) {
            let first_loc = self.format_loc(self.node(first).loc);
            let message = format!(
                "duplicate declaration of '{}' (first declared at {})",
                self.name(name),
                first_loc
            );
            let loc = self.node(decl).loc;
            self.error(DiagKind::Name, loc, message);
            return;
        }
        self.scope_mut(target).symbols.insert(name, decl);
    }

    /// Bind a name directly into a scope, bypassing `NoScope` transparency.
    /// Used for `#foreach` key/value and template parameter bindings.
    pub fn bind_symbol(&mut self, scope: ScopeId, name: Ident, entity: AstIndex) {
        self.scope_mut(scope).symbols.insert(name, entity);
    }

    /// Walk the scope chain upward looking for `name`. Module imports are
    /// searched after a scope's own symbols, one level deep.
    pub fn lookup(&self, from: ScopeId, name: Ident) -> Option<AstIndex> {
        let mut current = from;
        while !current.is_none() {
            let scope = self.scope(current);
            if let Some(&entity) = scope.symbols.get(&name) {
                return Some(entity);
            }
            for &import in &scope.imports {
                if let Some(&entity) = self.scope(import).symbols.get(&name) {
                    return Some(entity);
                }
            }
            current = scope.parent;
        }
        None
    }

    // ---- modules ----

    /// Add a parsed module to the package tree. Two files declaring the
    /// same dotted path is an error citing both files; the first mapping
    /// wins so later lookups still succeed in exactly one of them.
    pub fn add_module(&mut self, module: AstIndex, file: u32) {
        let AstData::Module { full_path, .. } = self.node(module).data else {
            return;
        };
        self.modules.push(module);
        if let Some(&first) = self.module_paths.get(&full_path) {
            let first_file = self.files[self.node(first).loc.file as usize].name.clone();
            let second_file = self.files[file as usize].name.clone();
            let message = format!(
                "module '{}' is declared by both {} and {}",
                self.name(full_path),
                first_file,
                second_file
            );
            let loc = self.node(module).loc;
            self.error(DiagKind::Name, loc, message);
            return;
        }
        self.module_paths.insert(full_path, module);
    }

    // ---- files ----

    /// Add a source file and tokenize it into the shared buffer.
    pub fn add_file(&mut self, name: impl Into<String>, source: impl Into<String>) -> u32 {
        let file = self.files.len() as u32;
        let source = source.into();
        let first_token = lexer::lex_file(&mut self.tokens, file, &source, &mut self.diagnostics);
        self.files.push(SourceFile {
            name: name.into(),
            source,
            first_token,
            module: AstIndex::UNDEF,
        });
        file
    }

    // ---- names & diagnostics ----

    pub fn intern(&mut self, s: &str) -> Ident {
        self.interner.get_or_intern(s)
    }

    pub fn name(&self, id: Ident) -> &str {
        self.interner.resolve(id)
    }

    pub fn format_loc(&self, loc: SourceLoc) -> String {
        match self.files.get(loc.file as usize) {
            Some(file) => {
                let (line, col) = lexer::line_col(&file.source, loc.offset);
                format!("{}:{}:{}", file.name, line, col)
            }
            None => "<unknown>".to_string(),
        }
    }

    pub fn error(&mut self, kind: DiagKind, loc: SourceLoc, message: String) {
        self.diagnostics.report(kind, loc, message);
    }

    /// Report an unrecoverable diagnostic and return the unwind marker.
    pub fn fatal(&mut self, kind: DiagKind, loc: SourceLoc, message: String) -> Fatal {
        self.diagnostics.report(kind, loc, message);
        Fatal
    }

    /// Render every collected diagnostic, in report order.
    pub fn rendered_diagnostics(&self) -> Vec<String> {
        self.diagnostics
            .iter()
            .map(|d| format!("{}: error: {}", self.format_loc(d.loc), d.message))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_types_resolve_through_root() {
        let mut ctx = CompilationContext::new(CompilerConfig::default());
        let i32_id = ctx.intern("i32");
        let node = ctx.lookup(ctx.root_scope, i32_id).expect("i32 in root scope");
        assert!(matches!(ctx.node(node).data, AstData::TypeBasic { basic: BasicType::I32 }));
    }

    #[test]
    fn test_builtin_functions_resolve() {
        let ctx = CompilationContext::new(CompilerConfig::default());
        let node = ctx.lookup(ctx.root_scope, known::SIZE_OF).expect("$size_of bound");
        assert!(matches!(ctx.node(node).data, AstData::BuiltinFunc { func: BuiltinFn::SizeOf }));
    }

    #[test]
    fn test_defines_become_manifest_constants() {
        let config = CompilerConfig::new().with_define("DEBUG", 1);
        let mut ctx = CompilationContext::new(config);
        let id = ctx.intern("DEBUG");
        let member = ctx.lookup(ctx.root_scope, id).expect("DEBUG bound");
        assert_eq!(ctx.enum_values.get(&member), Some(&1));
    }

    #[test]
    fn test_duplicate_symbol_reports_and_keeps_first(){
        let mut ctx = CompilationContext::new(CompilerConfig::default());
        let name = ctx.intern("x");
        let scope = ctx.new_scope(ScopeKind::Local, ctx.root_scope, AstIndex::UNDEF, "test");
        let a = ctx.add_node(SourceLoc::default(), AstData::BreakStmt);
        let b = ctx.add_node(SourceLoc::default(), AstData::BreakStmt);
        ctx.insert_symbol(scope, name, a);
        ctx.insert_symbol(scope, name, b);
        assert_eq!(ctx.diagnostics.count_of(DiagKind::Name), 1);
        assert_eq!(ctx.lookup(scope, name), Some(a));
    }

    #[test]
    fn test_no_scope_registration_is_transparent() {
        let mut ctx = CompilationContext::new(CompilerConfig::default());
        let name = ctx.intern("y");
        let outer = ctx.new_scope(ScopeKind::Local, ctx.root_scope, AstIndex::UNDEF, "outer");
        let inner = ctx.new_scope(ScopeKind::NoScope, outer, AstIndex::UNDEF, "attrs");
        let decl = ctx.add_node(SourceLoc::default(), AstData::BreakStmt);
        ctx.insert_symbol(inner, name, decl);
        // registered into the outer scope, but visible from the inner chain
        assert!(ctx.scope(outer).symbols.contains_key(&name));
        assert_eq!(ctx.lookup(inner, name), Some(decl));
    }

    #[test]
    fn test_bound_names_in_no_scope_shadow_outer() {
        let mut ctx = CompilationContext::new(CompilerConfig::default());
        let name = ctx.intern("v");
        let outer = ctx.new_scope(ScopeKind::Local, ctx.root_scope, AstIndex::UNDEF, "outer");
        let inner = ctx.new_scope(ScopeKind::NoScope, outer, AstIndex::UNDEF, "instance");
        let outer_decl = ctx.add_node(SourceLoc::default(), AstData::BreakStmt);
        let inner_decl = ctx.add_node(SourceLoc::default(), AstData::ContinueStmt);
        ctx.insert_symbol(outer, name, outer_decl);
        ctx.bind_symbol(inner, name, inner_decl);
        assert_eq!(ctx.lookup(inner, name), Some(inner_decl));
        assert_eq!(ctx.lookup(outer, name), Some(outer_decl));
    }
}
