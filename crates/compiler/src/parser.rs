//! Parser for Mica source.
//!
//! Declarations and statements are parsed by recursive descent; expressions
//! by a Pratt (top-down operator precedence) parser driven by binding-power
//! constants. A `prefer_type` mode is threaded through expression parsing to
//! disambiguate `T*` (pointer type) from `a*b` (multiplication); `arr[]`
//! always parses as a slice type, `arr[i]` as an index expression left for
//! the type checker to disambiguate against `T[N]` and `Name[Args]`.
//!
//! Parse errors are recoverable: the parser reports a diagnostic, attaches
//! an error-sentinel node and resynchronizes with `skip_past`, so one
//! compile surfaces multiple issues.

use crate::arena::PoolSlice;
use crate::ast::{
    flags, AstData, AstIndex, AstKind, AttrInfo, AttributeKind, BinOp, UnOp, attr_flags,
};
use crate::context::CompilationContext;
use crate::errors::{DiagKind, SourceLoc};
use crate::interner::{known, Ident};
use crate::lexer::{self, TokenKind};
use crate::scope::{ScopeId, ScopeKind};

/// Binding powers for the Pratt expression parser. The constants encode
/// C-like precedence; they only need to be ordered, not dense.
mod bp {
    pub const ASSIGN: u16 = 30;
    pub const LOGIC_OR: u16 = 70;
    pub const LOGIC_AND: u16 = 90;
    pub const BIT_OR: u16 = 110;
    pub const BIT_XOR: u16 = 130;
    pub const BIT_AND: u16 = 150;
    pub const EQUALITY: u16 = 170;
    pub const COMPARISON: u16 = 190;
    pub const SHIFT: u16 = 210;
    pub const ADDITIVE: u16 = 230;
    pub const MULTIPLICATIVE: u16 = 250;
    pub const PREFIX: u16 = 290;
    pub const POSTFIX: u16 = 310;
}

fn infix_power(kind: TokenKind) -> Option<(u16, BinOp)> {
    let entry = match kind {
        TokenKind::Slash => (bp::MULTIPLICATIVE, BinOp::Div),
        TokenKind::Percent => (bp::MULTIPLICATIVE, BinOp::Rem),
        TokenKind::Plus => (bp::ADDITIVE, BinOp::Add),
        TokenKind::Minus => (bp::ADDITIVE, BinOp::Sub),
        TokenKind::LtLt => (bp::SHIFT, BinOp::Shl),
        TokenKind::GtGt => (bp::SHIFT, BinOp::Shr),
        TokenKind::Lt => (bp::COMPARISON, BinOp::Lt),
        TokenKind::Gt => (bp::COMPARISON, BinOp::Gt),
        TokenKind::LtEq => (bp::COMPARISON, BinOp::Le),
        TokenKind::GtEq => (bp::COMPARISON, BinOp::Ge),
        TokenKind::EqEq => (bp::EQUALITY, BinOp::Eq),
        TokenKind::BangEq => (bp::EQUALITY, BinOp::Ne),
        TokenKind::Amp => (bp::BIT_AND, BinOp::BitAnd),
        TokenKind::Caret => (bp::BIT_XOR, BinOp::BitXor),
        TokenKind::Pipe => (bp::BIT_OR, BinOp::BitOr),
        TokenKind::AmpAmp => (bp::LOGIC_AND, BinOp::LogicAnd),
        TokenKind::PipePipe => (bp::LOGIC_OR, BinOp::LogicOr),
        TokenKind::Eq => (bp::ASSIGN, BinOp::Assign),
        _ => return None,
    };
    Some(entry)
}

/// What kind of item list is being parsed; decides the per-item parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemCtx {
    /// Module or attribute-block level: declarations only.
    Decl,
    /// Struct body: declarations that become members.
    Struct,
    /// Function/block body: statements (declarations allowed).
    Stmt,
}

/// Attribute-stack counters. The attribute stack's top `immediate` entries
/// attach to the next declaration only; the `scope_lvl` entries below them
/// attach to every following declaration in the current scope. Effective
/// attributes are both together.
#[derive(Debug, Clone, Copy, Default)]
struct AttribState {
    immediate: usize,
    scope_lvl: usize,
}

impl AttribState {
    fn effective(self) -> usize {
        self.immediate + self.scope_lvl
    }
}

pub struct Parser<'a> {
    ctx: &'a mut CompilationContext,
    file: u32,
    /// Current token index, absolute in the shared buffer.
    tok: u32,
    current_scope: ScopeId,
    prefer_type: bool,
    attrib: AttribState,
    attr_stack: Vec<AstIndex>,
}

/// Parse one file into its module declaration.
pub fn parse_module_file(ctx: &mut CompilationContext, file: u32) -> AstIndex {
    let first = ctx.files[file as usize].first_token;
    let root = ctx.root_scope;
    let mut parser = Parser {
        ctx,
        file,
        tok: first,
        current_scope: root,
        prefer_type: false,
        attrib: AttribState::default(),
        attr_stack: Vec::new(),
    };
    let module = parser.parse_module();
    parser.ctx.files[file as usize].module = module;
    module
}

impl<'a> Parser<'a> {
    // ---- token cursor ----

    fn kind(&self) -> TokenKind {
        self.ctx.tokens.kinds[self.tok as usize]
    }

    fn peek_kind(&self, ahead: u32) -> TokenKind {
        let i = (self.tok + ahead) as usize;
        if i < self.ctx.tokens.kinds.len() { self.ctx.tokens.kinds[i] } else { TokenKind::Eof }
    }

    fn loc(&self) -> SourceLoc {
        SourceLoc::new(self.file, self.ctx.tokens.offsets[self.tok as usize])
    }

    fn token_text(&self) -> &str {
        let kind = self.kind();
        let offset = self.ctx.tokens.offsets[self.tok as usize];
        lexer::token_text(&self.ctx.files[self.file as usize].source, kind, offset)
    }

    fn advance(&mut self) {
        if self.kind() != TokenKind::Eof {
            self.tok += 1;
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.kind() == kind
    }

    fn accept(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> bool {
        if self.accept(kind) {
            return true;
        }
        let loc = self.loc();
        let got = self.describe_current();
        self.ctx.error(DiagKind::Parse, loc, format!("expected {}, got {}", what, got));
        false
    }

    fn describe_current(&self) -> String {
        match self.kind() {
            TokenKind::Eof => "end of file".to_string(),
            _ => format!("'{}'", self.token_text()),
        }
    }

    fn error_here(&mut self, message: String) -> AstIndex {
        let loc = self.loc();
        self.ctx.error(DiagKind::Parse, loc, message);
        self.ctx.common.error_node
    }

    /// Resynchronize after a parse error: skip to just past the next `;`,
    /// or stop before a `}` / end of file.
    fn skip_past_semicolon(&mut self) {
        let mut depth = 0u32;
        loop {
            match self.kind() {
                TokenKind::Eof => return,
                TokenKind::Semicolon if depth == 0 => {
                    self.advance();
                    return;
                }
                TokenKind::LBrace => {
                    depth += 1;
                    self.advance();
                }
                TokenKind::RBrace => {
                    if depth == 0 {
                        return;
                    }
                    depth -= 1;
                    self.advance();
                }
                _ => self.advance(),
            }
        }
    }

    fn intern_token(&mut self) -> Ident {
        let text = self.token_text().to_string();
        self.ctx.intern(&text)
    }

    fn expect_ident(&mut self, what: &str) -> Option<Ident> {
        if self.check(TokenKind::Ident) {
            let id = self.intern_token();
            self.advance();
            Some(id)
        } else {
            let loc = self.loc();
            let got = self.describe_current();
            self.ctx.error(DiagKind::Parse, loc, format!("expected {}, got {}", what, got));
            None
        }
    }

    // ---- attributes ----

    /// Parse a run of `@attr` tokens and the `:` / `{` attachment forms.
    /// Returns `true` when an attribute block `{` was opened and handled.
    fn parse_attributes(&mut self, items: &mut Vec<AstIndex>, item_ctx: ItemCtx) -> bool {
        loop {
            while self.check(TokenKind::At) {
                self.advance();
                let loc = self.loc();
                let Some(name) = self.expect_ident("attribute name") else {
                    self.skip_past_semicolon();
                    return false;
                };
                if name != known::EXTERN {
                    self.ctx.error(
                        DiagKind::Parse,
                        loc,
                        format!("unknown attribute '@{}'", self.ctx.name(name)),
                    );
                    self.skip_past_semicolon();
                    return false;
                }
                if let Some(attr) = self.parse_extern_attribute(loc) {
                    self.attr_stack.push(attr);
                    self.attrib.immediate += 1;
                }
            }

            if self.attrib.immediate > 0 {
                if self.accept(TokenKind::Colon) {
                    // scope-level: apply to every following decl in this
                    // scope; further attributes may follow the colon
                    self.attrib.scope_lvl += self.attrib.immediate;
                    self.attrib.immediate = 0;
                    if self.check(TokenKind::At) {
                        continue;
                    }
                    return false;
                }
                if self.check(TokenKind::LBrace) {
                    self.parse_attribute_block(items, item_ctx);
                    return true;
                }
            }
            return false;
        }
    }

    /// `@a { ... }`: a `no_scope` scope bounding the attributes' lifetime
    /// without introducing a name lookup level.
    fn parse_attribute_block(&mut self, items: &mut Vec<AstIndex>, item_ctx: ItemCtx) {
        self.expect(TokenKind::LBrace, "'{'");
        let saved_state = self.attrib;
        let saved_len = self.attr_stack.len();
        let saved_scope = self.current_scope;

        self.attrib = AttribState {
            immediate: 0,
            scope_lvl: saved_state.scope_lvl + saved_state.immediate,
        };
        self.current_scope =
            self.ctx.new_scope(ScopeKind::NoScope, saved_scope, AstIndex::UNDEF, "@attr-block");

        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            self.parse_item(items, item_ctx);
        }
        self.expect(TokenKind::RBrace, "'}'");

        self.current_scope = saved_scope;
        // entered attributes are dropped on scope exit
        self.attr_stack.truncate(saved_len - saved_state.immediate);
        self.attrib = AttribState { immediate: 0, scope_lvl: saved_state.scope_lvl };
    }

    fn parse_extern_attribute(&mut self, loc: SourceLoc) -> Option<AstIndex> {
        if !self.expect(TokenKind::LParen, "'(' after '@extern'") {
            return None;
        }
        let Some(selector) = self.expect_ident("'module' or 'syscall'") else {
            self.skip_past_semicolon();
            return None;
        };
        let kind = if selector == known::MODULE {
            if !self.expect(TokenKind::Comma, "','") {
                return None;
            }
            if !self.check(TokenKind::StrLit) {
                self.error_here("expected library name string".to_string());
                return None;
            }
            let text = self.token_text().to_string();
            self.advance();
            let library_name = lexer::decode_string(&text);
            let library = self.ctx.intern(&library_name);
            AttributeKind::ExternModule { library }
        } else if selector == known::SYSCALL {
            if !self.expect(TokenKind::Comma, "','") {
                return None;
            }
            if !self.check(TokenKind::IntLit) {
                self.error_here("expected syscall number".to_string());
                return None;
            }
            let number = lexer::int_value(self.token_text()).unwrap_or(0) as u32;
            self.advance();
            AttributeKind::ExternSyscall { number }
        } else {
            let name = self.ctx.name(selector).to_string();
            self.ctx.error(
                DiagKind::Parse,
                loc,
                format!("unknown @extern form '{}': expected 'module' or 'syscall'", name),
            );
            return None;
        };
        self.expect(TokenKind::RParen, "')'");
        Some(self.ctx.add_node(loc, AstData::Attribute { kind }))
    }

    /// Snapshot the current effective attributes onto a freshly made
    /// declaration, then consume the immediate ones.
    fn attach_attributes(&mut self, decl: AstIndex) {
        let effective = self.attrib.effective();
        if effective > 0 {
            let attributes: Vec<AstIndex> =
                self.attr_stack[self.attr_stack.len() - effective..].to_vec();
            let mut mask = 0u16;
            for &attr in &attributes {
                if let AstData::Attribute { kind } = self.ctx.node(attr).data {
                    mask |= match kind {
                        AttributeKind::ExternModule { .. } => attr_flags::EXTERN_MODULE,
                        AttributeKind::ExternSyscall { .. } => attr_flags::EXTERN_SYSCALL,
                    };
                }
            }
            let slot = self.ctx.add_attr_info(AttrInfo { attributes, flags: mask });
            let node = self.ctx.node_mut(decl);
            node.attr_info = slot;
            node.set_flag(flags::HAS_ATTRIBUTES);
        }
        let immediate = self.attrib.immediate;
        self.attr_stack.truncate(self.attr_stack.len() - immediate);
        self.attrib.immediate = 0;
    }

    // ---- modules & declarations ----

    fn parse_module(&mut self) -> AstIndex {
        let loc = self.loc();
        let (name, full_path) = if self.accept(TokenKind::KwModule) {
            let path = self.parse_dotted_path();
            self.expect(TokenKind::Semicolon, "';' after module declaration");
            path
        } else {
            self.error_here("expected 'module' declaration at start of file".to_string());
            let fallback = self.ctx.files[self.file as usize].name.clone();
            let id = self.ctx.intern(&fallback);
            (id, id)
        };

        // module node first so the scope can point back at its owner
        let module = self.ctx.add_node(
            loc,
            AstData::Module { name, full_path, scope: ScopeId::NONE, items: PoolSlice::EMPTY },
        );
        let scope = self.ctx.new_scope(
            ScopeKind::Global,
            self.ctx.root_scope,
            module,
            self.ctx.name(full_path).to_string(),
        );
        self.current_scope = scope;

        let mut items = Vec::new();
        while !self.check(TokenKind::Eof) {
            if self.check(TokenKind::RBrace) {
                self.error_here("unmatched '}'".to_string());
                self.advance();
                continue;
            }
            self.parse_item(&mut items, ItemCtx::Decl);
        }
        // remaining scope-level attributes are broadcast and dropped
        self.attr_stack.truncate(self.attr_stack.len() - self.attrib.scope_lvl);
        self.attrib = AttribState::default();

        let items = self.ctx.arrays.alloc(&items);
        if let AstData::Module { scope: s, items: it, .. } = &mut self.ctx.node_mut(module).data {
            *s = scope;
            *it = items;
        }
        module
    }

    fn parse_dotted_path(&mut self) -> (Ident, Ident) {
        let mut path = String::new();
        let mut last = String::new();
        loop {
            if self.check(TokenKind::Ident) {
                last = self.token_text().to_string();
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(&last);
                self.advance();
            } else {
                self.error_here("expected identifier in module path".to_string());
                break;
            }
            if !self.accept(TokenKind::Dot) {
                break;
            }
        }
        (self.ctx.intern(&last), self.ctx.intern(&path))
    }

    /// Parse one item (declaration or statement per `item_ctx`) into `items`.
    fn parse_item(&mut self, items: &mut Vec<AstIndex>, item_ctx: ItemCtx) {
        if self.parse_attributes(items, item_ctx) {
            return; // an attribute block already consumed its declarations
        }
        match self.kind() {
            TokenKind::Eof | TokenKind::RBrace => {}
            TokenKind::Error => self.advance(),
            TokenKind::Semicolon => self.advance(),
            TokenKind::KwModule => {
                self.error_here("'module' must be the first declaration of a file".to_string());
                self.skip_past_semicolon();
            }
            TokenKind::KwImport => {
                if let Some(import) = self.parse_import() {
                    items.push(import);
                }
            }
            TokenKind::KwAlias => {
                if let Some(alias) = self.parse_alias() {
                    items.push(alias);
                }
            }
            TokenKind::KwStruct | TokenKind::KwUnion => {
                if let Some(decl) = self.parse_struct() {
                    if item_ctx == ItemCtx::Struct {
                        self.ctx.node_mut(decl).set_flag(flags::IS_MEMBER);
                    }
                    items.push(decl);
                }
            }
            TokenKind::KwEnum => {
                if let Some(decl) = self.parse_enum() {
                    items.push(decl);
                }
            }
            TokenKind::HashIf => items.push(self.parse_static_if(item_ctx)),
            TokenKind::HashVersion => items.push(self.parse_static_version(item_ctx)),
            TokenKind::HashForeach => items.push(self.parse_static_foreach(item_ctx)),
            TokenKind::HashAssert => items.push(self.parse_static_assert()),
            _ if item_ctx == ItemCtx::Stmt => self.parse_statement(items),
            _ => {
                if let Some(decl) = self.parse_var_or_function() {
                    if item_ctx == ItemCtx::Struct {
                        self.ctx.node_mut(decl).set_flag(flags::IS_MEMBER);
                    }
                    if item_ctx != ItemCtx::Stmt {
                        self.ctx.node_mut(decl).set_flag(flags::IS_GLOBAL);
                    }
                    items.push(decl);
                }
            }
        }
    }

    fn parse_item_list(&mut self, item_ctx: ItemCtx) -> PoolSlice {
        let mut items = Vec::new();
        if self.expect(TokenKind::LBrace, "'{'") {
            let saved = self.attrib;
            self.attrib = AttribState::default();
            let saved_len = self.attr_stack.len();
            while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
                self.parse_item(&mut items, item_ctx);
            }
            self.expect(TokenKind::RBrace, "'}'");
            self.attr_stack.truncate(saved_len);
            self.attrib = saved;
        }
        self.ctx.arrays.alloc(&items)
    }

    fn parse_import(&mut self) -> Option<AstIndex> {
        let loc = self.loc();
        self.advance(); // import
        let (_, full_path) = self.parse_dotted_path();
        self.expect(TokenKind::Semicolon, "';' after import");
        Some(self.ctx.add_node(
            loc,
            AstData::Import { path: full_path, parent_scope: self.current_scope },
        ))
    }

    fn parse_alias(&mut self) -> Option<AstIndex> {
        let loc = self.loc();
        self.advance(); // alias
        let name = self.expect_ident("alias name")?;
        if !self.expect(TokenKind::Eq, "'=' after alias name") {
            self.skip_past_semicolon();
            return None;
        }
        let expr = self.parse_type_expr();
        self.expect(TokenKind::Semicolon, "';' after alias");
        let decl = self.ctx.add_node(
            loc,
            AstData::Alias { name, parent_scope: self.current_scope, expr },
        );
        self.attach_attributes(decl);
        Some(decl)
    }

    fn parse_struct(&mut self) -> Option<AstIndex> {
        let loc = self.loc();
        let is_union = self.check(TokenKind::KwUnion);
        self.advance(); // struct | union
        let name = self.expect_ident("struct name")?;

        let template_params = if self.check(TokenKind::LBracket) {
            self.parse_template_params()
        } else {
            PoolSlice::EMPTY
        };

        let decl = self.ctx.add_node(
            loc,
            AstData::StructDecl {
                name,
                parent_scope: self.current_scope,
                scope: ScopeId::NONE,
                members: PoolSlice::EMPTY,
                template_params,
            },
        );
        if is_union {
            self.ctx.node_mut(decl).set_flag(flags::IS_UNION);
        }
        self.attach_attributes(decl);

        if self.accept(TokenKind::Semicolon) {
            self.ctx.node_mut(decl).set_flag(flags::IS_OPAQUE);
            return Some(decl);
        }

        let member_scope = self.ctx.new_scope(
            ScopeKind::Member,
            self.current_scope,
            decl,
            self.ctx.name(name).to_string(),
        );
        let saved_scope = self.current_scope;
        self.current_scope = member_scope;
        let members = self.parse_item_list(ItemCtx::Struct);
        self.current_scope = saved_scope;

        if let AstData::StructDecl { scope, members: m, .. } = &mut self.ctx.node_mut(decl).data {
            *scope = member_scope;
            *m = members;
        }
        Some(decl)
    }

    fn parse_template_params(&mut self) -> PoolSlice {
        self.expect(TokenKind::LBracket, "'['");
        let mut params = Vec::new();
        while !self.check(TokenKind::RBracket) && !self.check(TokenKind::Eof) {
            let loc = self.loc();
            if let Some(name) = self.expect_ident("template parameter") {
                params.push(self.ctx.add_node(
                    loc,
                    AstData::Alias { name, parent_scope: self.current_scope, expr: AstIndex::UNDEF },
                ));
            } else {
                break;
            }
            if !self.accept(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBracket, "']'");
        self.ctx.arrays.alloc(&params)
    }

    /// The four enum shapes:
    /// `enum X;` | `enum X = e;` | `enum T X = e;` | `enum [X] [: T] { ... }`
    fn parse_enum(&mut self) -> Option<AstIndex> {
        let loc = self.loc();
        self.advance(); // enum

        // anonymous enum type: `enum : T { ... }` / `enum { ... }`
        if self.check(TokenKind::Colon) || self.check(TokenKind::LBrace) {
            return self.parse_enum_type(loc, Ident::UNDEFINED);
        }

        let first = self.expect_ident("enum name")?;

        match self.kind() {
            TokenKind::Semicolon => {
                // `enum X;` — type of default int type, no body
                self.advance();
                let base = self.ctx.basic_type(crate::ast::BasicType::I32);
                let decl = self.ctx.add_node(
                    loc,
                    AstData::EnumDecl {
                        name: first,
                        parent_scope: self.current_scope,
                        scope: ScopeId::NONE,
                        base_type: base,
                        members: PoolSlice::EMPTY,
                    },
                );
                self.attach_attributes(decl);
                Some(decl)
            }
            TokenKind::Eq => {
                // `enum X = e;` — manifest constant of inferred type
                self.advance();
                self.make_manifest_constant(loc, first, AstIndex::UNDEF)
            }
            TokenKind::Ident => {
                // `enum T X = e;` — manifest constant of explicit type.
                // `first` was actually the type name.
                let ty_use = self.ctx.add_node(
                    loc,
                    AstData::NameUse { name: first, scope: self.current_scope, entity: AstIndex::UNDEF },
                );
                let name = self.expect_ident("constant name")?;
                if !self.expect(TokenKind::Eq, "'=' after constant name") {
                    self.skip_past_semicolon();
                    return None;
                }
                self.make_manifest_constant(loc, name, ty_use)
            }
            TokenKind::Colon | TokenKind::LBrace => self.parse_enum_type(loc, first),
            _ => {
                self.error_here("expected ';', '=', ':' or '{' in enum declaration".to_string());
                self.skip_past_semicolon();
                None
            }
        }
    }

    fn make_manifest_constant(&mut self, loc: SourceLoc, name: Ident, ty: AstIndex) -> Option<AstIndex> {
        let value = self.parse_expr();
        self.expect(TokenKind::Semicolon, "';' after constant");
        let decl = self.ctx.add_node(
            loc,
            AstData::EnumMember { name, parent_scope: self.current_scope, ty, value },
        );
        self.attach_attributes(decl);
        Some(decl)
    }

    fn parse_enum_type(&mut self, loc: SourceLoc, name: Ident) -> Option<AstIndex> {
        let base_type = if self.accept(TokenKind::Colon) {
            self.parse_type_expr()
        } else {
            self.ctx.basic_type(crate::ast::BasicType::I32)
        };

        let decl = self.ctx.add_node(
            loc,
            AstData::EnumDecl {
                name,
                parent_scope: self.current_scope,
                scope: ScopeId::NONE,
                base_type,
                members: PoolSlice::EMPTY,
            },
        );
        self.attach_attributes(decl);

        let debug_name = if name.is_defined() {
            self.ctx.name(name).to_string()
        } else {
            "<anon-enum>".to_string()
        };
        let member_scope =
            self.ctx.new_scope(ScopeKind::Member, self.current_scope, decl, debug_name);

        self.expect(TokenKind::LBrace, "'{'");
        let mut members = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            let mloc = self.loc();
            let Some(mname) = self.expect_ident("enum member name") else {
                self.skip_past_semicolon();
                break;
            };
            let value = if self.accept(TokenKind::Eq) { self.parse_expr() } else { AstIndex::UNDEF };
            members.push(self.ctx.add_node(
                mloc,
                AstData::EnumMember { name: mname, parent_scope: member_scope, ty: AstIndex::UNDEF, value },
            ));
            if !self.accept(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "'}'");

        let members = self.ctx.arrays.alloc(&members);
        if let AstData::EnumDecl { scope, members: m, .. } = &mut self.ctx.node_mut(decl).data {
            *scope = member_scope;
            *m = members;
        }
        Some(decl)
    }

    // ---- static conditionals ----

    fn parse_static_if(&mut self, item_ctx: ItemCtx) -> AstIndex {
        let loc = self.loc();
        self.advance(); // #if
        self.expect(TokenKind::LParen, "'(' after '#if'");
        let condition = self.parse_expr();
        self.expect(TokenKind::RParen, "')'");
        let then_items = self.parse_item_list(item_ctx);
        let else_items = self.parse_static_else(item_ctx);
        self.ctx.add_node(loc, AstData::StaticIf { condition, then_items, else_items })
    }

    fn parse_static_version(&mut self, item_ctx: ItemCtx) -> AstIndex {
        let loc = self.loc();
        self.advance(); // #version
        self.expect(TokenKind::LParen, "'(' after '#version'");
        let name = self.expect_ident("version identifier").unwrap_or(Ident::UNDEFINED);
        self.expect(TokenKind::RParen, "')'");
        let then_items = self.parse_item_list(item_ctx);
        let else_items = self.parse_static_else(item_ctx);
        self.ctx.add_node(loc, AstData::StaticVersion { name, then_items, else_items })
    }

    fn parse_static_else(&mut self, item_ctx: ItemCtx) -> PoolSlice {
        if !self.accept(TokenKind::KwElse) {
            return PoolSlice::EMPTY;
        }
        // `else #if(...)` / `else #version(...)` chains nest as one item
        match self.kind() {
            TokenKind::HashIf => {
                let nested = self.parse_static_if(item_ctx);
                self.ctx.arrays.alloc(&[nested])
            }
            TokenKind::HashVersion => {
                let nested = self.parse_static_version(item_ctx);
                self.ctx.arrays.alloc(&[nested])
            }
            _ => self.parse_item_list(item_ctx),
        }
    }

    fn parse_static_foreach(&mut self, item_ctx: ItemCtx) -> AstIndex {
        let loc = self.loc();
        self.advance(); // #foreach
        self.expect(TokenKind::LParen, "'(' after '#foreach'");
        let key = self.expect_ident("key binding").unwrap_or(Ident::UNDEFINED);
        self.expect(TokenKind::Comma, "','");
        let value = self.expect_ident("value binding").unwrap_or(Ident::UNDEFINED);
        self.expect(TokenKind::Semicolon, "';' before iterable");
        let iterable = self.parse_expr();
        self.expect(TokenKind::RParen, "')'");

        // the body scope is the clone source; expansion rebinds a fresh
        // instance scope per iteration
        let body_scope =
            self.ctx.new_scope(ScopeKind::NoScope, self.current_scope, AstIndex::UNDEF, "#foreach");
        let saved_scope = self.current_scope;
        self.current_scope = body_scope;
        let body = self.parse_item_list(item_ctx);
        self.current_scope = saved_scope;

        self.ctx.add_node(loc, AstData::StaticForeach { key, value, iterable, body_scope, body })
    }

    fn parse_static_assert(&mut self) -> AstIndex {
        let loc = self.loc();
        self.advance(); // #assert
        self.expect(TokenKind::LParen, "'(' after '#assert'");
        let condition = self.parse_expr();
        let message = if self.accept(TokenKind::Comma) {
            if self.check(TokenKind::StrLit) {
                let text = self.token_text().to_string();
                let mloc = self.loc();
                self.advance();
                let value = lexer::decode_string(&text);
                let index = self.ctx.add_string(value);
                self.ctx.add_node(mloc, AstData::StringLiteral { index })
            } else {
                self.error_here("expected string message in '#assert'".to_string())
            }
        } else {
            AstIndex::UNDEF
        };
        self.expect(TokenKind::RParen, "')'");
        self.expect(TokenKind::Semicolon, "';' after '#assert'");
        self.ctx.add_node(loc, AstData::StaticAssert { condition, message })
    }

    // ---- variables & functions ----

    /// `T name;` | `T name = init;` | `T name(params) ... ` after the leading
    /// type expression has been recognized.
    fn parse_var_or_function(&mut self) -> Option<AstIndex> {
        let loc = self.loc();
        let ty = self.parse_type_expr();
        if ty == self.ctx.common.error_node {
            self.skip_past_semicolon();
            return None;
        }

        if !self.check(TokenKind::Ident) {
            self.error_here("expected declaration name after type".to_string());
            self.skip_past_semicolon();
            return None;
        }
        let name = self.intern_token();
        self.advance();

        let template_params = if self.check(TokenKind::LBracket) {
            self.parse_template_params()
        } else {
            PoolSlice::EMPTY
        };

        if self.check(TokenKind::LParen) {
            return self.parse_function(loc, ty, name, template_params);
        }

        let initializer = if self.accept(TokenKind::Eq) { self.parse_expr() } else { AstIndex::UNDEF };
        self.expect(TokenKind::Semicolon, "';' after declaration");
        let decl = self.ctx.add_node(
            loc,
            AstData::VarDecl { name, parent_scope: self.current_scope, ty, initializer },
        );
        self.attach_attributes(decl);
        Some(decl)
    }

    fn parse_function(
        &mut self,
        loc: SourceLoc,
        return_type: AstIndex,
        name: Ident,
        template_params: PoolSlice,
    ) -> Option<AstIndex> {
        let func_scope = self.ctx.new_scope(
            ScopeKind::Local,
            self.current_scope,
            AstIndex::UNDEF,
            self.ctx.name(name).to_string(),
        );

        let saved_scope = self.current_scope;
        self.current_scope = func_scope;
        let params = self.parse_params();
        self.current_scope = saved_scope;

        let signature =
            self.ctx.add_node(loc, AstData::FunctionSignature { return_type, params });
        let decl = self.ctx.add_node(
            loc,
            AstData::FunctionDecl {
                name,
                parent_scope: self.current_scope,
                scope: func_scope,
                signature,
                body: AstIndex::UNDEF,
                template_params,
                ir_index: 0,
            },
        );
        self.ctx.scope_mut(func_scope).owner = decl;
        // snapshot the attributes against the signature, per the three-phase
        // protocol; the body below parses with a zeroed attribute state
        self.attach_attributes(decl);

        if self.accept(TokenKind::HashInline) {
            self.ctx.node_mut(decl).set_flag(flags::IS_INLINE);
        }

        if self.accept(TokenKind::Semicolon) {
            self.ctx.node_mut(decl).set_flag(flags::IS_EXTERNAL);
            self.ctx.all_functions.push(decl);
            return Some(decl);
        }

        let saved_scope = self.current_scope;
        self.current_scope = func_scope;
        let body = self.parse_block_with_scope(func_scope);
        self.current_scope = saved_scope;

        if let AstData::FunctionDecl { body: b, .. } = &mut self.ctx.node_mut(decl).data {
            *b = body;
        }
        self.ctx.all_functions.push(decl);
        Some(decl)
    }

    fn parse_params(&mut self) -> PoolSlice {
        self.expect(TokenKind::LParen, "'('");
        let mut params = Vec::new();
        while !self.check(TokenKind::RParen) && !self.check(TokenKind::Eof) {
            let loc = self.loc();
            let ty = self.parse_type_expr();
            let name = if self.check(TokenKind::Ident) {
                let id = self.intern_token();
                self.advance();
                id
            } else {
                Ident::UNDEFINED
            };
            let initializer =
                if self.accept(TokenKind::Eq) { self.parse_expr() } else { AstIndex::UNDEF };
            let param = self.ctx.add_node(
                loc,
                AstData::VarDecl { name, parent_scope: self.current_scope, ty, initializer },
            );
            self.ctx.node_mut(param).set_flag(flags::IS_PARAMETER);
            if self.accept(TokenKind::Ellipsis) {
                self.ctx.node_mut(param).set_flag(flags::IS_VARIADIC_PARAM);
            }
            params.push(param);
            if !self.accept(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen, "')'");
        self.ctx.arrays.alloc(&params)
    }

    // ---- statements ----

    fn parse_block_with_scope(&mut self, scope: ScopeId) -> AstIndex {
        let loc = self.loc();
        let saved = self.current_scope;
        self.current_scope = scope;
        let items = self.parse_item_list(ItemCtx::Stmt);
        self.current_scope = saved;
        self.ctx.add_node(loc, AstData::Block { scope, items })
    }

    fn parse_block(&mut self) -> AstIndex {
        let scope =
            self.ctx.new_scope(ScopeKind::Local, self.current_scope, AstIndex::UNDEF, "block");
        self.parse_block_with_scope(scope)
    }

    fn parse_statement(&mut self, items: &mut Vec<AstIndex>) {
        let loc = self.loc();
        match self.kind() {
            TokenKind::LBrace => items.push(self.parse_block()),
            TokenKind::KwIf => {
                self.advance();
                self.expect(TokenKind::LParen, "'(' after 'if'");
                let condition = self.parse_expr();
                self.expect(TokenKind::RParen, "')'");
                let then_stmt = self.parse_embedded_statement();
                let else_stmt = if self.accept(TokenKind::KwElse) {
                    self.parse_embedded_statement()
                } else {
                    AstIndex::UNDEF
                };
                items.push(self.ctx.add_node(loc, AstData::IfStmt { condition, then_stmt, else_stmt }));
            }
            TokenKind::KwWhile => {
                self.advance();
                self.expect(TokenKind::LParen, "'(' after 'while'");
                let condition = self.parse_expr();
                self.expect(TokenKind::RParen, "')'");
                let body = self.parse_embedded_statement();
                items.push(self.ctx.add_node(loc, AstData::WhileStmt { condition, body }));
            }
            TokenKind::KwFor => items.push(self.parse_for()),
            TokenKind::KwReturn => {
                self.advance();
                let value =
                    if self.check(TokenKind::Semicolon) { AstIndex::UNDEF } else { self.parse_expr() };
                self.expect(TokenKind::Semicolon, "';' after 'return'");
                items.push(self.ctx.add_node(loc, AstData::ReturnStmt { value }));
            }
            TokenKind::KwBreak => {
                self.advance();
                self.expect(TokenKind::Semicolon, "';' after 'break'");
                items.push(self.ctx.add_node(loc, AstData::BreakStmt));
            }
            TokenKind::KwContinue => {
                self.advance();
                self.expect(TokenKind::Semicolon, "';' after 'continue'");
                items.push(self.ctx.add_node(loc, AstData::ContinueStmt));
            }
            _ => {
                if let Some(item) = self.parse_expr_or_var_decl() {
                    items.push(item);
                }
            }
        }
    }

    fn parse_embedded_statement(&mut self) -> AstIndex {
        let mut items = Vec::new();
        self.parse_item(&mut items, ItemCtx::Stmt);
        match items.len() {
            0 => AstIndex::UNDEF,
            1 => items[0],
            // a single parse position expanded to several items (e.g. an
            // attribute block); wrap them so the statement stays one node
            _ => {
                let loc = self.loc();
                let scope = self.current_scope;
                let slice = self.ctx.arrays.alloc(&items);
                self.ctx.add_node(loc, AstData::Block { scope, items: slice })
            }
        }
    }

    fn parse_for(&mut self) -> AstIndex {
        let loc = self.loc();
        self.advance(); // for
        let scope = self.ctx.new_scope(ScopeKind::Local, self.current_scope, AstIndex::UNDEF, "for");
        let saved = self.current_scope;
        self.current_scope = scope;

        self.expect(TokenKind::LParen, "'(' after 'for'");
        let init = if self.accept(TokenKind::Semicolon) {
            AstIndex::UNDEF
        } else {
            self.parse_expr_or_var_decl().unwrap_or(AstIndex::UNDEF)
        };
        let condition =
            if self.check(TokenKind::Semicolon) { AstIndex::UNDEF } else { self.parse_expr() };
        self.expect(TokenKind::Semicolon, "';' after loop condition");
        let increment =
            if self.check(TokenKind::RParen) { AstIndex::UNDEF } else { self.parse_expr() };
        self.expect(TokenKind::RParen, "')'");
        let body = self.parse_embedded_statement();

        self.current_scope = saved;
        self.ctx.add_node(loc, AstData::ForStmt { scope, init, condition, increment, body })
    }

    /// A statement that is either a variable declaration (`T name ...`) or
    /// an expression. Parsed with `prefer_type` on until the decision falls.
    fn parse_expr_or_var_decl(&mut self) -> Option<AstIndex> {
        let loc = self.loc();
        let saved_prefer = self.prefer_type;
        self.prefer_type = true;
        let expr = self.parse_expr_bp(0);
        self.prefer_type = saved_prefer;

        if self.check(TokenKind::Ident) && looks_like_type(self.ctx, expr) {
            let name = self.intern_token();
            self.advance();
            let initializer =
                if self.accept(TokenKind::Eq) { self.parse_expr() } else { AstIndex::UNDEF };
            self.expect(TokenKind::Semicolon, "';' after declaration");
            let decl = self.ctx.add_node(
                loc,
                AstData::VarDecl { name, parent_scope: self.current_scope, ty: expr, initializer },
            );
            self.attach_attributes(decl);
            return Some(decl);
        }

        if expr == self.ctx.common.error_node {
            self.skip_past_semicolon();
            return None;
        }
        self.expect(TokenKind::Semicolon, "';' after expression");
        Some(expr)
    }

    // ---- expressions ----

    fn parse_expr(&mut self) -> AstIndex {
        let saved = self.prefer_type;
        self.prefer_type = false;
        let expr = self.parse_expr_bp(0);
        self.prefer_type = saved;
        expr
    }

    fn parse_type_expr(&mut self) -> AstIndex {
        let saved = self.prefer_type;
        self.prefer_type = true;
        let expr = self.parse_expr_bp(0);
        self.prefer_type = saved;
        expr
    }

    fn parse_expr_bp(&mut self, min_bp: u16) -> AstIndex {
        let mut left = self.parse_prefix();

        loop {
            let loc = self.loc();
            match self.kind() {
                TokenKind::Dot if bp::POSTFIX > min_bp => {
                    self.advance();
                    let Some(member) = self.expect_ident("member name") else {
                        return self.ctx.common.error_node;
                    };
                    left = self.ctx.add_node(
                        loc,
                        AstData::MemberExpr {
                            object: left,
                            member,
                            entity: AstIndex::UNDEF,
                            member_index: 0,
                        },
                    );
                }
                TokenKind::LParen if bp::POSTFIX > min_bp => {
                    self.advance();
                    let args = self.parse_call_args();
                    left = self.ctx.add_node(loc, AstData::CallExpr { callee: left, args });
                }
                TokenKind::LBracket if bp::POSTFIX > min_bp => {
                    self.advance();
                    if self.accept(TokenKind::RBracket) {
                        // `T[]` — slice type constructor
                        let node =
                            self.ctx.add_node(loc, AstData::TypeSlice { element: left });
                        self.ctx.node_mut(node).set_flag(flags::IS_TYPE);
                        left = node;
                    } else {
                        let indices = self.parse_index_args();
                        left = self.ctx.add_node(loc, AstData::IndexExpr { base: left, indices });
                    }
                }
                TokenKind::Star if bp::MULTIPLICATIVE > min_bp => {
                    if self.star_means_pointer_type() {
                        self.advance();
                        let node = self.ctx.add_node(loc, AstData::TypePtr { target: left });
                        self.ctx.node_mut(node).set_flag(flags::IS_TYPE);
                        left = node;
                    } else {
                        self.advance();
                        let saved = self.prefer_type;
                        self.prefer_type = false;
                        let right = self.parse_expr_bp(bp::MULTIPLICATIVE);
                        self.prefer_type = saved;
                        left = self.ctx.add_node(
                            loc,
                            AstData::BinaryExpr { op: BinOp::Mul, left, right },
                        );
                    }
                }
                TokenKind::KwFunction if bp::MULTIPLICATIVE > min_bp => {
                    // `RetT function(params)` — function-signature type
                    self.advance();
                    let params = self.parse_params();
                    let node = self
                        .ctx
                        .add_node(loc, AstData::FunctionSignature { return_type: left, params });
                    self.ctx.node_mut(node).set_flag(flags::IS_TYPE);
                    left = node;
                }
                kind => {
                    let Some((lbp, op)) = infix_power(kind) else { break };
                    if lbp <= min_bp {
                        break;
                    }
                    self.advance();
                    // right-associative assignment re-enters at lbp - 1
                    let rhs_bp = if op == BinOp::Assign { lbp - 1 } else { lbp };
                    let saved = self.prefer_type;
                    self.prefer_type = false;
                    let right = self.parse_expr_bp(rhs_bp);
                    self.prefer_type = saved;
                    left = self.ctx.add_node(loc, AstData::BinaryExpr { op, left, right });
                }
            }
        }

        left
    }

    /// The star decision: a `*` after a type-shaped left operand is a
    /// postfix pointer-type constructor when its right context cannot begin
    /// a multiplication operand, or when types are preferred here.
    fn star_means_pointer_type(&self) -> bool {
        match self.peek_kind(1) {
            TokenKind::Comma
            | TokenKind::RParen
            | TokenKind::RBracket
            | TokenKind::LBracket
            | TokenKind::Semicolon
            | TokenKind::KwFunction
            | TokenKind::RBrace
            | TokenKind::Eof => true,
            TokenKind::Ident | TokenKind::Star => self.prefer_type,
            _ => false,
        }
    }

    fn parse_prefix(&mut self) -> AstIndex {
        let loc = self.loc();
        match self.kind() {
            TokenKind::IntLit => {
                let value = lexer::int_value(self.token_text()).unwrap_or_else(|| {
                    // overflow reported, value clamped
                    0
                });
                if lexer::int_value(self.token_text()).is_none() {
                    self.ctx.error(
                        DiagKind::Parse,
                        loc,
                        format!("integer literal '{}' does not fit in 64 bits", self.token_text()),
                    );
                }
                self.advance();
                self.ctx.add_node(loc, AstData::IntLiteral { value })
            }
            TokenKind::StrLit => {
                let text = self.token_text().to_string();
                self.advance();
                let value = lexer::decode_string(&text);
                let index = self.ctx.add_string(value);
                self.ctx.add_node(loc, AstData::StringLiteral { index })
            }
            TokenKind::KwTrue | TokenKind::KwFalse => {
                let value = self.check(TokenKind::KwTrue);
                self.advance();
                self.ctx.add_node(loc, AstData::BoolLiteral { value })
            }
            TokenKind::KwNull => {
                self.advance();
                self.ctx.add_node(loc, AstData::NullLiteral)
            }
            TokenKind::Ident => {
                let name = self.intern_token();
                self.advance();
                self.ctx.add_node(
                    loc,
                    AstData::NameUse { name, scope: self.current_scope, entity: AstIndex::UNDEF },
                )
            }
            TokenKind::LParen => {
                self.advance();
                let saved = self.prefer_type;
                self.prefer_type = false;
                let inner = self.parse_expr_bp(0);
                self.prefer_type = saved;
                self.expect(TokenKind::RParen, "')'");
                inner
            }
            TokenKind::LBracket => {
                self.advance();
                let mut elements = Vec::new();
                let saved = self.prefer_type;
                self.prefer_type = false;
                while !self.check(TokenKind::RBracket) && !self.check(TokenKind::Eof) {
                    elements.push(self.parse_expr_bp(0));
                    if !self.accept(TokenKind::Comma) {
                        break;
                    }
                }
                self.prefer_type = saved;
                self.expect(TokenKind::RBracket, "']'");
                let items = self.ctx.arrays.alloc(&elements);
                self.ctx.add_node(loc, AstData::LiteralArray { items })
            }
            TokenKind::KwCast => {
                self.advance();
                self.expect(TokenKind::LParen, "'(' after 'cast'");
                let ty = self.parse_type_expr();
                self.expect(TokenKind::RParen, "')'");
                let expr = self.parse_unary_operand();
                self.ctx.add_node(loc, AstData::CastExpr { ty, expr })
            }
            TokenKind::Minus => self.parse_unary(loc, UnOp::Neg),
            TokenKind::Bang => self.parse_unary(loc, UnOp::Not),
            TokenKind::Tilde => self.parse_unary(loc, UnOp::BitNot),
            TokenKind::Amp => self.parse_unary(loc, UnOp::AddrOf),
            TokenKind::Star => self.parse_unary(loc, UnOp::Deref),
            _ => {
                let got = self.describe_current();
                let node = self.error_here(format!("expected expression, got {}", got));
                // leave resynchronization tokens for the statement level
                if !matches!(
                    self.kind(),
                    TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
                ) {
                    self.advance();
                }
                node
            }
        }
    }

    fn parse_unary(&mut self, loc: SourceLoc, op: UnOp) -> AstIndex {
        self.advance();
        let operand = self.parse_unary_operand();
        self.ctx.add_node(loc, AstData::UnaryExpr { op, operand })
    }

    fn parse_unary_operand(&mut self) -> AstIndex {
        let saved = self.prefer_type;
        self.prefer_type = false;
        let operand = self.parse_expr_bp(bp::PREFIX);
        self.prefer_type = saved;
        operand
    }

    fn parse_call_args(&mut self) -> PoolSlice {
        let mut args = Vec::new();
        let saved = self.prefer_type;
        self.prefer_type = false;
        while !self.check(TokenKind::RParen) && !self.check(TokenKind::Eof) {
            args.push(self.parse_expr_bp(0));
            if !self.accept(TokenKind::Comma) {
                break;
            }
        }
        self.prefer_type = saved;
        self.expect(TokenKind::RParen, "')'");
        self.ctx.arrays.alloc(&args)
    }

    fn parse_index_args(&mut self) -> PoolSlice {
        let mut indices = Vec::new();
        let saved = self.prefer_type;
        self.prefer_type = false;
        while !self.check(TokenKind::RBracket) && !self.check(TokenKind::Eof) {
            indices.push(self.parse_expr_bp(0));
            if !self.accept(TokenKind::Comma) {
                break;
            }
        }
        self.prefer_type = saved;
        self.expect(TokenKind::RBracket, "']'");
        self.ctx.arrays.alloc(&indices)
    }
}

/// Could this parsed expression be the type of a declaration? Used to split
/// `T name;` declarations from expression statements.
fn looks_like_type(ctx: &CompilationContext, expr: AstIndex) -> bool {
    if expr.is_undef() {
        return false;
    }
    match ctx.node(expr).kind() {
        AstKind::NameUse
        | AstKind::TypeBasic
        | AstKind::TypePtr
        | AstKind::TypeSlice
        | AstKind::TypeStaticArray
        | AstKind::FunctionSignature
        | AstKind::IndexExpr
        | AstKind::MemberExpr => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompilerConfig;

    fn parse(source: &str) -> (CompilationContext, AstIndex) {
        let mut ctx = CompilationContext::new(CompilerConfig::default());
        let file = ctx.add_file("test.mica", source);
        let module = parse_module_file(&mut ctx, file);
        (ctx, module)
    }

    fn module_items(ctx: &CompilationContext, module: AstIndex) -> Vec<AstIndex> {
        match ctx.node(module).data {
            AstData::Module { items, .. } => ctx.list(items),
            _ => panic!("not a module"),
        }
    }

    #[test]
    fn test_parse_module_header() {
        let (ctx, module) = parse("module a.b;\n");
        assert!(ctx.diagnostics.is_empty());
        let AstData::Module { full_path, name, .. } = ctx.node(module).data else {
            panic!("expected module")
        };
        assert_eq!(ctx.name(full_path), "a.b");
        assert_eq!(ctx.name(name), "b");
    }

    #[test]
    fn test_parse_var_and_function() {
        let (ctx, module) = parse("module m;\ni32 counter = 0;\ni32 add(i32 a, i32 b) { return a + b; }\n");
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        let items = module_items(&ctx, module);
        assert_eq!(items.len(), 2);
        assert_eq!(ctx.kind_of(items[0]), AstKind::VarDecl);
        assert_eq!(ctx.kind_of(items[1]), AstKind::FunctionDecl);
        assert!(ctx.node(items[0]).has_flag(flags::IS_GLOBAL));
        let AstData::FunctionDecl { signature, body, .. } = ctx.node(items[1]).data else {
            panic!()
        };
        let AstData::FunctionSignature { params, .. } = ctx.node(signature).data else { panic!() };
        assert_eq!(params.len, 2);
        assert!(body.is_defined());
    }

    #[test]
    fn test_pointer_type_vs_multiplication() {
        let (ctx, module) = parse("module m;\nvoid f() { u8* p = null; i64 x = 2 * 3; }\n");
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        let items = module_items(&ctx, module);
        let AstData::FunctionDecl { body, .. } = ctx.node(items[0]).data else { panic!() };
        let AstData::Block { items: stmts, .. } = ctx.node(body).data else { panic!() };
        let stmts = ctx.list(stmts);
        let AstData::VarDecl { ty, .. } = ctx.node(stmts[0]).data else { panic!() };
        assert_eq!(ctx.kind_of(ty), AstKind::TypePtr);
        let AstData::VarDecl { initializer, .. } = ctx.node(stmts[1]).data else { panic!() };
        let AstData::BinaryExpr { op, .. } = ctx.node(initializer).data else { panic!() };
        assert_eq!(op, BinOp::Mul);
    }

    #[test]
    fn test_precedence_shift_vs_additive() {
        // a + b << c must parse as (a + b) << c
        let (ctx, module) = parse("module m;\nvoid f() { x = a + b << c; }\n");
        let items = module_items(&ctx, module);
        let AstData::FunctionDecl { body, .. } = ctx.node(items[0]).data else { panic!() };
        let AstData::Block { items: stmts, .. } = ctx.node(body).data else { panic!() };
        let stmts = ctx.list(stmts);
        let AstData::BinaryExpr { op: assign, right, .. } = ctx.node(stmts[0]).data else {
            panic!()
        };
        assert_eq!(assign, BinOp::Assign);
        let AstData::BinaryExpr { op: shl, left, .. } = ctx.node(right).data else { panic!() };
        assert_eq!(shl, BinOp::Shl);
        let AstData::BinaryExpr { op: add, .. } = ctx.node(left).data else { panic!() };
        assert_eq!(add, BinOp::Add);
    }

    #[test]
    fn test_assignment_is_right_associative() {
        let (ctx, module) = parse("module m;\nvoid f() { a = b = c; }\n");
        let items = module_items(&ctx, module);
        let AstData::FunctionDecl { body, .. } = ctx.node(items[0]).data else { panic!() };
        let AstData::Block { items: stmts, .. } = ctx.node(body).data else { panic!() };
        let stmts = ctx.list(stmts);
        let AstData::BinaryExpr { op, right, .. } = ctx.node(stmts[0]).data else { panic!() };
        assert_eq!(op, BinOp::Assign);
        let AstData::BinaryExpr { op: inner, .. } = ctx.node(right).data else { panic!() };
        assert_eq!(inner, BinOp::Assign);
    }

    #[test]
    fn test_enum_shapes() {
        let (ctx, module) = parse(
            "module m;\n\
             enum Flag;\n\
             enum SIZE = 16;\n\
             enum u8 KIND = 3;\n\
             enum Color : u8 { red, green = 5, blue }\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        let items = module_items(&ctx, module);
        assert_eq!(items.len(), 4);
        assert_eq!(ctx.kind_of(items[0]), AstKind::EnumDecl);
        assert_eq!(ctx.kind_of(items[1]), AstKind::EnumMember);
        assert_eq!(ctx.kind_of(items[2]), AstKind::EnumMember);
        assert_eq!(ctx.kind_of(items[3]), AstKind::EnumDecl);
        let AstData::EnumDecl { members, .. } = ctx.node(items[3]).data else { panic!() };
        assert_eq!(members.len, 3);
    }

    #[test]
    fn test_attribute_forms() {
        let (ctx, module) = parse(
            "module m;\n\
             @extern(module, \"kernel32\")\n\
             void single();\n\
             void bare();\n\
             @extern(syscall, 60):\n\
             void scoped1();\n\
             void scoped2();\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        let items = module_items(&ctx, module);
        assert_eq!(items.len(), 4);
        // bare @a <decl>: only that decl carries it
        assert!(ctx.attr_info(items[0]).is_some());
        assert!(ctx.attr_info(items[1]).is_none());
        // @a: every following decl in the scope carries it
        let scoped1 = ctx.attr_info(items[2]).expect("scoped1 attrs");
        assert_eq!(scoped1.flags, attr_flags::EXTERN_SYSCALL);
        assert!(ctx.attr_info(items[3]).is_some());
    }

    #[test]
    fn test_attribute_block_bounds_lifetime() {
        let (ctx, module) = parse(
            "module m;\n\
             @extern(module, \"libc\") {\n\
             void inside1();\n\
             void inside2();\n\
             }\n\
             void outside();\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        let items = module_items(&ctx, module);
        assert_eq!(items.len(), 3);
        assert!(ctx.attr_info(items[0]).is_some());
        assert!(ctx.attr_info(items[1]).is_some());
        assert!(ctx.attr_info(items[2]).is_none());
    }

    #[test]
    fn test_attributes_do_not_leak_into_bodies() {
        let (ctx, module) = parse(
            "module m;\n\
             @extern(module, \"libc\"):\n\
             void f() { i32 local = 0; }\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        let items = module_items(&ctx, module);
        let AstData::FunctionDecl { body, .. } = ctx.node(items[0]).data else { panic!() };
        assert!(ctx.attr_info(items[0]).is_some());
        let AstData::Block { items: stmts, .. } = ctx.node(body).data else { panic!() };
        let stmts = ctx.list(stmts);
        assert!(ctx.attr_info(stmts[0]).is_none());
    }

    #[test]
    fn test_static_items_parse() {
        let (ctx, module) = parse(
            "module m;\n\
             #version(linux) { enum A = 1; } else { enum A = 2; }\n\
             #if(A) { i32 x = 0; }\n\
             #assert(A, \"A must hold\");\n\
             #foreach(i, v; handlers) { enum u32 slot = i; }\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        let items = module_items(&ctx, module);
        assert_eq!(ctx.kind_of(items[0]), AstKind::StaticVersion);
        assert_eq!(ctx.kind_of(items[1]), AstKind::StaticIf);
        assert_eq!(ctx.kind_of(items[2]), AstKind::StaticAssert);
        assert_eq!(ctx.kind_of(items[3]), AstKind::StaticForeach);
    }

    #[test]
    fn test_parse_error_recovers() {
        let (ctx, module) = parse(
            "module m;\n\
             i32 broken = ;\n\
             i32 fine = 2;\n",
        );
        assert_eq!(ctx.diagnostics.count_of(DiagKind::Parse), 1);
        let items = module_items(&ctx, module);
        // the second declaration still parsed
        assert!(items.iter().any(|&i| {
            matches!(ctx.node(i).data, AstData::VarDecl { name, .. } if ctx.name(name) == "fine")
        }));
    }

    #[test]
    fn test_slice_and_static_array_types() {
        let (ctx, module) = parse("module m;\nvoid f(u8[] s, u8 buf) { }\n");
        assert!(ctx.diagnostics.is_empty());
        let items = module_items(&ctx, module);
        let AstData::FunctionDecl { signature, .. } = ctx.node(items[0]).data else { panic!() };
        let AstData::FunctionSignature { params, .. } = ctx.node(signature).data else { panic!() };
        let params = ctx.list(params);
        let AstData::VarDecl { ty, .. } = ctx.node(params[0]).data else { panic!() };
        assert_eq!(ctx.kind_of(ty), AstKind::TypeSlice);
    }

    #[test]
    fn test_templated_struct_and_function() {
        let (ctx, module) = parse(
            "module m;\n\
             struct Box[T] { T* ptr; }\n\
             T pick[T](T a, T b) { return a; }\n",
        );
        assert!(ctx.diagnostics.is_empty(), "{:?}", ctx.rendered_diagnostics());
        let items = module_items(&ctx, module);
        let AstData::StructDecl { template_params, .. } = ctx.node(items[0]).data else { panic!() };
        assert_eq!(template_params.len, 1);
        let AstData::FunctionDecl { template_params, .. } = ctx.node(items[1]).data else {
            panic!()
        };
        assert_eq!(template_params.len, 1);
    }
}
