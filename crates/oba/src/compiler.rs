//! The single-pass compiler: lexing, Pratt parsing and bytecode emission in
//! one walk.
//!
//! There is no AST. The parser emits instructions as it recognizes grammar,
//! using a precedence-climbing loop for expressions. A chain of per-function
//! [`Compiler`] states tracks local slots and captured variables; resolving a
//! name walks the chain, rewriting captures into upvalue references at every
//! level in between.
//!
//! Functions under construction live on the heap (their chunks accumulate
//! constants that the collector must see), so each one is registered as a
//! compiler root for the duration of its compilation.

use crate::bytecode::{Chunk, MAX_CONSTANTS, Opcode};
use crate::error::{CompileError, CompileErrorKind};
use crate::heap::{HeapId, Obj, ObjCtor, ObjFunction};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::value::Value;
use crate::vm::Vm;

/// The most locals one function scope can hold; slots are a single byte.
const MAX_LOCALS: usize = u8::MAX as usize;

/// The most upvalues one function can close over.
const MAX_UPVALUES: usize = u8::MAX as usize;

/// Jump distances are 16-bit.
const MAX_JUMP: usize = u16::MAX as usize;

/// Operator binding strength, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Lowest,
    Assign,
    Cond,
    Sum,
    Product,
    Member,
}

fn precedence_of(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::Assign => Precedence::Assign,
        TokenKind::Gt
        | TokenKind::Lt
        | TokenKind::Gte
        | TokenKind::Lte
        | TokenKind::Eq
        | TokenKind::Neq => Precedence::Cond,
        TokenKind::Plus | TokenKind::Minus => Precedence::Sum,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Precedence::Product,
        TokenKind::Member => Precedence::Member,
        _ => Precedence::None,
    }
}

/// A stack-resident variable as the compiler sees it.
#[derive(Debug)]
struct Local {
    name: String,
    /// Scope depth, or -1 while the initializer is still being compiled.
    depth: i32,
    /// Whether a nested function captures this local.
    captured: bool,
}

/// One `(is_local, slot)` pair emitted after a `Closure` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

enum LocalResolution {
    NotFound,
    Found(u8),
    Uninitialized,
}

enum ResolveFailure {
    Uninitialized,
    TooManyUpvalues,
}

/// Where a declared variable lives.
enum VarSlot {
    /// Top-level: a name constant for `DefineGlobal`.
    Global(u8),
    /// A stack slot; nothing to emit, the value is already in place.
    Local,
}

/// Per-function compilation state.
struct Compiler {
    enclosing: Option<Box<Compiler>>,
    /// The function being built, already in the heap.
    function: HeapId,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: u32,
}

impl Compiler {
    fn new(function: HeapId, enclosing: Option<Box<Compiler>>) -> Self {
        Self {
            enclosing,
            function,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    fn resolve_local(&self, name: &str) -> LocalResolution {
        for (slot, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth < 0 {
                    return LocalResolution::Uninitialized;
                }
                #[allow(clippy::cast_possible_truncation)]
                return LocalResolution::Found(slot as u8);
            }
        }
        LocalResolution::NotFound
    }

    /// Resolves `name` against the enclosing function chain, registering an
    /// upvalue at every level between the local and this function.
    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, ResolveFailure> {
        let in_parent = match self.enclosing.as_deref() {
            None => return Ok(None),
            Some(parent) => parent.resolve_local(name),
        };

        match in_parent {
            LocalResolution::Found(slot) => {
                let parent = self.enclosing.as_deref_mut().expect("parent exists");
                parent.locals[slot as usize].captured = true;
                self.add_upvalue(slot, true).map(Some)
            }
            LocalResolution::Uninitialized => Err(ResolveFailure::Uninitialized),
            LocalResolution::NotFound => {
                let parent = self.enclosing.as_deref_mut().expect("parent exists");
                match parent.resolve_upvalue(name)? {
                    Some(upvalue) => self.add_upvalue(upvalue, false).map(Some),
                    None => Ok(None),
                }
            }
        }
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, ResolveFailure> {
        let wanted = UpvalueRef { index, is_local };
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if *upvalue == wanted {
                #[allow(clippy::cast_possible_truncation)]
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() >= MAX_UPVALUES {
            return Err(ResolveFailure::TooManyUpvalues);
        }
        self.upvalues.push(wanted);
        #[allow(clippy::cast_possible_truncation)]
        Ok((self.upvalues.len() - 1) as u8)
    }
}

/// Compiles `source` against `module`, returning the module's top-level
/// function or every diagnostic the pass produced.
pub(crate) fn compile(
    vm: &mut Vm,
    module: HeapId,
    source: &str,
) -> Result<HeapId, Vec<CompileError>> {
    let module_name = vm.heap.str(vm.heap.module(module).name).chars.clone();

    vm.heap.push_temp_root(Value::Obj(module));
    let function = vm.allocate(Obj::Function(ObjFunction {
        module,
        arity: 0,
        upvalue_count: 0,
        chunk: Chunk::new(),
        name: None,
    }));
    vm.heap.pop_temp_root();
    vm.compiler_roots.push(function);

    let mut parser = Parser::new(vm, module, module_name, source, function);

    parser.ignore_newlines();
    while !parser.match_token(TokenKind::Eof) {
        parser.declaration();
        // If no newline follows, the file must end on this line.
        if !parser.match_line() {
            parser.consume(TokenKind::Eof, "Expected end of file.");
            break;
        }
    }

    let errors = std::mem::take(&mut parser.errors);
    if errors.is_empty() {
        parser.emit_op(Opcode::EndModule);
        parser.emit_op(Opcode::Exit);
        vm.compiler_roots.pop();
        Ok(function)
    } else {
        vm.compiler_roots.pop();
        Err(errors)
    }
}

struct Parser<'vm, 'src> {
    vm: &'vm mut Vm,
    lexer: Lexer<'src>,
    current: Token,
    previous: Token,
    module: HeapId,
    module_name: String,
    errors: Vec<CompileError>,
    compiler: Compiler,
}

impl<'vm, 'src> Parser<'vm, 'src> {
    fn new(
        vm: &'vm mut Vm,
        module: HeapId,
        module_name: String,
        source: &'src str,
        function: HeapId,
    ) -> Self {
        let mut parser = Self {
            vm,
            lexer: Lexer::new(source),
            current: Token::synthetic(TokenKind::Eof),
            previous: Token::synthetic(TokenKind::Eof),
            module,
            module_name,
            errors: Vec::new(),
            compiler: Compiler::new(function, None),
        };
        // Prime the lookahead.
        parser.current = parser.lexer.next_token();
        parser.drain_lex_diagnostics();
        parser
    }

    // Tokens ------------------------------------------------------------

    fn next_token(&mut self) {
        if self.current.kind == TokenKind::Eof {
            self.previous = self.current.clone();
            return;
        }
        let token = self.lexer.next_token();
        self.drain_lex_diagnostics();
        self.previous = std::mem::replace(&mut self.current, token);
    }

    fn drain_lex_diagnostics(&mut self) {
        for (line, message) in self.lexer.take_diagnostics() {
            self.errors.push(CompileError {
                kind: CompileErrorKind::Lex,
                module: self.module_name.clone(),
                line,
                message,
            });
        }
    }

    fn peek(&self) -> TokenKind {
        self.current.kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.peek() != kind {
            return false;
        }
        self.next_token();
        true
    }

    fn match_line(&mut self) -> bool {
        if !self.match_token(TokenKind::Newline) {
            return false;
        }
        while self.match_token(TokenKind::Newline) {}
        true
    }

    fn ignore_newlines(&mut self) {
        self.match_line();
    }

    /// Moves past the next token, which must have the expected kind.
    fn consume(&mut self, kind: TokenKind, message: &str) {
        self.next_token();
        if self.previous.kind != kind {
            self.error(message);
            if self.current.kind == kind {
                self.next_token();
            }
        }
    }

    // Diagnostics -------------------------------------------------------

    fn error(&mut self, message: impl Into<String>) {
        // The lexer already reported this token.
        if self.previous.kind == TokenKind::Error {
            return;
        }
        self.errors.push(CompileError {
            kind: CompileErrorKind::Parse,
            module: self.module_name.clone(),
            line: self.previous.line,
            message: message.into(),
        });
    }

    // Emission ----------------------------------------------------------

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.vm.heap.function_mut(self.compiler.function).chunk
    }

    fn chunk_len(&self) -> usize {
        self.vm.heap.function(self.compiler.function).chunk.code.len()
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: Opcode) {
        self.emit_byte(op as u8);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.chunk_mut().add_constant(value);
        if index >= MAX_CONSTANTS {
            self.error("Too many constants in one function");
            return 0;
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            index as u8
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_op(Opcode::Constant);
        self.emit_byte(constant);
    }

    /// Emits `Error` with a message constant; reaching it raises at runtime.
    fn emit_error(&mut self, message: &str) {
        let text = self.vm.intern(message);
        let constant = self.make_constant(Value::Obj(text));
        self.emit_op(Opcode::Error);
        self.emit_byte(constant);
    }

    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk_len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 to account for the placeholder bytes.
        let jump = self.chunk_len() - offset - 2;
        if jump > MAX_JUMP {
            self.error("Too much code to jump over");
            return;
        }
        let chunk = self.chunk_mut();
        chunk.code[offset] = (jump >> 8) as u8;
        chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    /// Emits a back-edge to the absolute chunk offset `start`.
    fn emit_loop(&mut self, start: usize) {
        self.emit_op(Opcode::Loop);
        if start > MAX_JUMP {
            self.error("Loop body too large");
        }
        self.emit_byte((start >> 8) as u8);
        self.emit_byte((start & 0xff) as u8);
    }

    // Variables ---------------------------------------------------------

    fn add_local(&mut self, name: String) {
        if self.compiler.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function");
            return;
        }
        self.compiler.locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
    }

    /// Declares the variable named by `name`, leaving locals uninitialized
    /// so their own initializer cannot read them.
    fn declare_variable(&mut self, name: &Token) -> VarSlot {
        if self.compiler.scope_depth == 0 {
            let id = self.vm.intern(&name.lexeme);
            let constant = self.make_constant(Value::Obj(id));
            return VarSlot::Global(constant);
        }

        let mut duplicate = false;
        for local in self.compiler.locals.iter().rev() {
            if local.depth >= 0 && (local.depth as u32) < self.compiler.scope_depth {
                break;
            }
            if local.name == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Variable with this name already declared in this scope");
        }
        self.add_local(name.lexeme.clone());
        VarSlot::Local
    }

    fn define_variable(&mut self, slot: VarSlot) {
        match slot {
            VarSlot::Local => {
                // The value already sits in the local's stack slot.
                let local = self
                    .compiler
                    .locals
                    .last_mut()
                    .expect("a local was just declared");
                local.depth = self.compiler.scope_depth as i32;
            }
            VarSlot::Global(constant) => {
                self.emit_op(Opcode::DefineGlobal);
                self.emit_byte(constant);
            }
        }
    }

    fn begin_scope(&mut self) {
        self.compiler.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler.scope_depth -= 1;
        loop {
            let Some(local) = self.compiler.locals.last() else {
                break;
            };
            if local.depth <= self.compiler.scope_depth as i32 {
                break;
            }
            let captured = local.captured;
            self.compiler.locals.pop();
            if captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
        }
    }

    // Declarations and statements ---------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Import) {
            self.import();
        } else if self.match_token(TokenKind::Data) {
            self.data();
        } else {
            self.statement();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Fn) {
            self.function_definition();
        } else if self.match_token(TokenKind::Let) {
            self.variable_declaration();
        } else if self.match_token(TokenKind::Debug) {
            self.debug_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.block_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else {
            self.expression();
            // Top-level expression results are discarded; inside a function
            // the last one left is the return value.
            if self.compiler.scope_depth == 0 {
                self.emit_op(Opcode::Pop);
            }
        }
    }

    fn import(&mut self) {
        if !self.match_token(TokenKind::Str) {
            self.error("Expected a string after 'import'");
            return;
        }
        let name = self.vm.intern(self.previous.string_value());
        let constant = self.make_constant(Value::Obj(name));
        self.emit_op(Opcode::ImportModule);
        self.emit_byte(constant);
    }

    fn data(&mut self) {
        self.consume(TokenKind::Ident, "Expected an identifier.");
        let family = self.vm.intern(&self.previous.lexeme);
        self.vm.heap.push_temp_root(Value::Obj(family));
        self.consume(TokenKind::Assign, "Expected '='");

        loop {
            self.ignore_newlines();
            self.constructor(family);
            if !self.match_token(TokenKind::Guard) {
                break;
            }
        }
        self.vm.heap.pop_temp_root();
    }

    fn constructor(&mut self, family: HeapId) {
        self.consume(TokenKind::Ident, "Expected an identifier");
        let name_token = self.previous.clone();
        let slot = self.declare_variable(&name_token);

        // Field names are just for show; only the arity matters at runtime.
        let mut arity = 0usize;
        while self.match_token(TokenKind::Ident) {
            arity += 1;
        }

        let name = self.vm.intern(&name_token.lexeme);
        self.vm.heap.push_temp_root(Value::Obj(name));
        let ctor = self.vm.allocate(Obj::Ctor(ObjCtor { family, name, arity }));
        self.vm.heap.pop_temp_root();

        self.emit_constant(Value::Obj(ctor));
        self.define_variable(slot);
    }

    fn variable_declaration(&mut self) {
        self.consume(TokenKind::Ident, "Expected an identifier.");
        // Take the name but keep the variable out of scope while its
        // initializer compiles.
        let name = self.previous.clone();
        let slot = self.declare_variable(&name);

        self.consume(TokenKind::Assign, "Expected '='");
        self.ignore_newlines();
        self.expression();

        self.define_variable(slot);
    }

    fn debug_statement(&mut self) {
        self.expression();
        self.emit_op(Opcode::Debug);
    }

    fn block_statement(&mut self) {
        self.begin_scope();
        self.ignore_newlines();

        while self.peek() != TokenKind::RightBrace && self.peek() != TokenKind::Eof {
            self.statement();
            self.ignore_newlines();
        }

        self.consume(TokenKind::RightBrace, "Expected '}' at the end of block");
        self.end_scope();
    }

    fn if_statement(&mut self) {
        self.expression();
        let then_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.statement();

        if self.match_token(TokenKind::Else) {
            let else_jump = self.emit_jump(Opcode::Jump);
            self.patch_jump(then_jump);
            self.statement();
            self.patch_jump(else_jump);
        } else {
            self.patch_jump(then_jump);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk_len();
        self.expression();
        let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
    }

    // Functions ---------------------------------------------------------

    /// Opens a nested compiler for a function body. Every `begin_function`
    /// is paired with an `end_function`.
    fn begin_function(&mut self) {
        let module = self.module;
        let function = self.vm.allocate(Obj::Function(ObjFunction {
            module,
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: None,
        }));
        self.vm.compiler_roots.push(function);

        let enclosing = std::mem::replace(&mut self.compiler, Compiler::new(function, None));
        self.compiler.enclosing = Some(Box::new(enclosing));
        self.begin_scope();
    }

    /// Closes the innermost function compiler and emits the `Closure`
    /// instruction for it in the enclosing function. Returns the arity.
    fn end_function(&mut self, name: Option<&Token>) -> usize {
        let function = self.compiler.function;
        if let Some(name) = name {
            let id = self.vm.intern(&name.lexeme);
            self.vm.heap.function_mut(function).name = Some(id);
        }
        self.emit_op(Opcode::Return);

        let upvalues = std::mem::take(&mut self.compiler.upvalues);
        self.vm.heap.function_mut(function).upvalue_count = upvalues.len();
        let arity = self.vm.heap.function(function).arity;

        let enclosing = self
            .compiler
            .enclosing
            .take()
            .expect("function compilers always have an enclosing compiler");
        self.compiler = *enclosing;
        self.vm.compiler_roots.pop();

        let constant = self.make_constant(Value::Obj(function));
        self.emit_op(Opcode::Closure);
        self.emit_byte(constant);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local));
            self.emit_byte(upvalue.index);
        }

        arity
    }

    fn parameter_list(&mut self) {
        while self.match_token(TokenKind::Ident) {
            let name = self.previous.clone();
            let slot = self.declare_variable(&name);
            self.define_variable(slot);
            self.vm.heap.function_mut(self.compiler.function).arity += 1;
        }
    }

    fn function_definition(&mut self) {
        if !self.match_token(TokenKind::Ident) {
            self.error("Expected an identifier");
            return;
        }
        let name = self.previous.clone();

        self.begin_function();
        self.parameter_list();
        self.ignore_newlines();
        self.function_body();
        self.end_function(Some(&name));

        let slot = self.declare_variable(&name);
        self.define_variable(slot);
    }

    fn function_body(&mut self) {
        if self.peek() == TokenKind::LeftBrace {
            self.next_token();
            self.function_block_body();
            return;
        }

        if self.match_token(TokenKind::Assign) {
            self.ignore_newlines();
            self.expression_body();
            return;
        }

        self.error("Missing function body");
    }

    fn function_block_body(&mut self) {
        self.ignore_newlines();
        while !self.match_token(TokenKind::RightBrace) {
            if self.peek() == TokenKind::Eof {
                self.error("Expected '}' at the end of function body");
                break;
            }
            self.statement();
            self.ignore_newlines();
        }
    }

    /// The single-expression form of a function body. `if` is allowed here
    /// so conditionals can be used in result position.
    fn expression_body(&mut self) {
        if self.match_token(TokenKind::If) {
            self.if_statement();
        } else {
            self.expression();
        }
    }

    /// Compiles a match-equation lambda: parameters, `=`, one expression.
    /// Returns its arity.
    fn lambda(&mut self) -> usize {
        self.begin_function();
        self.parameter_list();
        self.ignore_newlines();
        self.consume(TokenKind::Assign, "Missing lambda expression");
        self.ignore_newlines();
        self.expression_body();
        self.end_function(None)
    }

    // Expressions -------------------------------------------------------

    fn expression(&mut self) {
        self.parse(Precedence::Lowest);
    }

    fn parse(&mut self, precedence: Precedence) {
        self.next_token();
        let can_assign = precedence < Precedence::Cond;

        if !self.prefix(self.previous.kind, can_assign) {
            self.error("Expected an expression");
            return;
        }

        while precedence < precedence_of(self.peek()) {
            self.next_token();
            self.infix(self.previous.kind, can_assign);
        }
    }

    /// Dispatches on the prefix role of `kind`. Returns false if the token
    /// cannot begin an expression.
    fn prefix(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::Not => self.unary_op(),
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Ident => self.identifier(can_assign),
            TokenKind::Number
            | TokenKind::Str
            | TokenKind::True
            | TokenKind::False => self.literal(),
            TokenKind::Interpolation => self.interpolation(),
            TokenKind::Match => self.match_expression(),
            _ => return false,
        }
        true
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Member => self.member(can_assign),
            _ => self.infix_op(kind),
        }
    }

    fn grouping(&mut self) {
        self.ignore_newlines();
        self.expression();
        self.ignore_newlines();
        self.consume(TokenKind::RightParen, "Expected ')' after expression.");
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::True => self.emit_op(Opcode::True),
            TokenKind::False => self.emit_op(Opcode::False),
            TokenKind::Number => {
                let value = Value::Number(self.previous.number_value());
                self.emit_constant(value);
            }
            TokenKind::Str | TokenKind::Interpolation => {
                let id = self.vm.intern(self.previous.string_value());
                self.emit_constant(Value::Obj(id));
            }
            _ => self.error("Expected a literal value."),
        }
    }

    /// An interpolated string: alternating literal fragments and spliced
    /// expressions, folded together with string coercion and `Add`.
    fn interpolation(&mut self) {
        let mut first = true;
        loop {
            // The literal fragment before the interpolation point.
            self.literal();
            self.ignore_newlines();

            // The interpolated expression, coerced and appended.
            self.expression();
            self.ignore_newlines();
            self.emit_op(Opcode::String);
            self.emit_op(Opcode::Add);

            if !first {
                self.emit_op(Opcode::Add);
            }
            first = false;

            if !self.match_token(TokenKind::Interpolation) {
                break;
            }
        }

        // The trailing fragment.
        self.consume(TokenKind::Str, "Expect end of string interpolation.");
        self.literal();
        self.emit_op(Opcode::Add);
    }

    fn unary_op(&mut self) {
        let op = self.previous.kind;
        self.ignore_newlines();
        self.parse(Precedence::None);
        match op {
            TokenKind::Not => self.emit_op(Opcode::Not),
            _ => self.error("Invalid unary operator"),
        }
    }

    fn infix_op(&mut self, op: TokenKind) {
        let op_lexeme = self.previous.lexeme.clone();
        self.ignore_newlines();
        // Left-associative: the right operand binds one level tighter.
        self.parse(precedence_of(op));

        let opcode = match op {
            TokenKind::Plus => Opcode::Add,
            TokenKind::Minus => Opcode::Minus,
            TokenKind::Star => Opcode::Multiply,
            TokenKind::Slash => Opcode::Divide,
            TokenKind::Percent => Opcode::Modulo,
            TokenKind::Gt => Opcode::Gt,
            TokenKind::Lt => Opcode::Lt,
            TokenKind::Gte => Opcode::Gte,
            TokenKind::Lte => Opcode::Lte,
            TokenKind::Eq => Opcode::Eq,
            TokenKind::Neq => Opcode::Neq,
            _ => {
                self.error(format!("Invalid operator '{op_lexeme}'"));
                return;
            }
        };
        self.emit_op(opcode);
    }

    fn identifier(&mut self, can_assign: bool) {
        self.variable(can_assign);
        if self.peek() == TokenKind::LeftParen {
            self.function_call();
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.clone();
        let is_set = can_assign && self.match_token(TokenKind::Assign);

        enum Target {
            Local(u8),
            Upvalue(u8),
            Global(u8),
        }

        let target = match self.compiler.resolve_local(&name.lexeme) {
            LocalResolution::Found(slot) => Some(Target::Local(slot)),
            LocalResolution::Uninitialized => {
                self.error("Cannot read local variable in its own initializer");
                None
            }
            LocalResolution::NotFound => match self.compiler.resolve_upvalue(&name.lexeme) {
                Ok(Some(index)) => Some(Target::Upvalue(index)),
                Ok(None) => None,
                Err(ResolveFailure::Uninitialized) => {
                    self.error("Cannot read local variable in its own initializer");
                    None
                }
                Err(ResolveFailure::TooManyUpvalues) => {
                    self.error("Too many closure variables in function");
                    None
                }
            },
        };

        let target = match target {
            Some(target) => target,
            None => {
                // Not a local or upvalue: a module global, resolved at
                // runtime. Globals are write-once from user code.
                if is_set {
                    self.error("Cannot reassign global variable");
                }
                let id = self.vm.intern(&name.lexeme);
                Target::Global(self.make_constant(Value::Obj(id)))
            }
        };

        if is_set {
            self.ignore_newlines();
            self.expression();
        }

        let (op, operand) = match (&target, is_set) {
            (Target::Local(slot), false) => (Opcode::GetLocal, *slot),
            (Target::Local(slot), true) => (Opcode::SetLocal, *slot),
            (Target::Upvalue(index), false) => (Opcode::GetUpvalue, *index),
            (Target::Upvalue(index), true) => (Opcode::SetUpvalue, *index),
            (Target::Global(constant), _) => (Opcode::GetGlobal, *constant),
        };
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn member(&mut self, _can_assign: bool) {
        self.next_token();
        if self.previous.kind != TokenKind::Ident {
            self.error("Expected an identifier after '::'");
            return;
        }
        let id = self.vm.intern(&self.previous.lexeme);
        let constant = self.make_constant(Value::Obj(id));
        self.emit_op(Opcode::GetImportedVariable);
        self.emit_byte(constant);

        if self.peek() == TokenKind::LeftParen {
            self.function_call();
        }
    }

    fn function_call(&mut self) {
        self.consume(TokenKind::LeftParen, "Expected '(' before parameter list");
        let argc = self.argument_list();
        self.consume(TokenKind::RightParen, "Expected ')' after parameter list");
        self.emit_op(Opcode::Call);
        self.emit_byte(argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc = 0usize;
        self.ignore_newlines();
        if self.peek() == TokenKind::RightParen {
            return 0;
        }
        loop {
            argc += 1;
            if argc > u8::MAX as usize {
                self.error("Too many arguments");
            }
            self.expression();
            self.ignore_newlines();
            if !self.match_token(TokenKind::Comma) {
                break;
            }
            self.ignore_newlines();
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            argc.min(u8::MAX as usize) as u8
        }
    }

    // Match expressions -------------------------------------------------

    fn match_expression(&mut self) {
        // The scrutinee, compiled once.
        self.expression();
        self.ignore_newlines();

        if !self.match_token(TokenKind::Guard) {
            self.error("Expected guard after match expression");
            return;
        }

        self.equation();
        self.consume(TokenKind::Semicolon, "Expected ';'");
    }

    fn equation(&mut self) {
        self.pattern();

        // The right-hand side only runs if the pattern matched; its
        // parameters bind the pattern's destructured fields.
        let arity = self.lambda();

        let skip_this_equation = self.emit_jump(Opcode::JumpIfNotMatch);

        // On a match the fields are already in place; call immediately.
        self.emit_op(Opcode::Call);
        #[allow(clippy::cast_possible_truncation)]
        self.emit_byte(arity.min(u8::MAX as usize) as u8);

        let skip_remaining = self.emit_jump(Opcode::Jump);
        self.patch_jump(skip_this_equation);

        self.ignore_newlines();
        if self.match_token(TokenKind::Guard) {
            self.equation();
        } else {
            // Falling off the last equation means nothing matched.
            self.emit_error("Match expression evaluated to nothing");
        }

        self.patch_jump(skip_remaining);
    }

    fn pattern(&mut self) {
        self.next_token();
        match self.previous.kind {
            TokenKind::True => self.emit_op(Opcode::True),
            TokenKind::False => self.emit_op(Opcode::False),
            TokenKind::Number => {
                let value = Value::Number(self.previous.number_value());
                self.emit_constant(value);
            }
            TokenKind::Str => {
                let id = self.vm.intern(self.previous.string_value());
                self.emit_constant(Value::Obj(id));
            }
            TokenKind::Ident => self.variable(false),
            _ => self.error("Expected a constant value."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileErrorKind;
    use crate::heap::ObjModule;
    use crate::table::SymbolTable;

    fn try_compile(source: &str) -> Result<HeapId, Vec<CompileError>> {
        let mut vm = Vm::new(&[]);
        let name = vm.intern("main");
        vm.heap.push_temp_root(Value::Obj(name));
        let module = vm.allocate(Obj::Module(ObjModule {
            name,
            variables: SymbolTable::new(),
        }));
        vm.heap.pop_temp_root();
        compile(&mut vm, module, source)
    }

    fn first_error(source: &str) -> CompileError {
        let errors = try_compile(source).expect_err("expected a compile error");
        errors.into_iter().next().expect("at least one error")
    }

    #[test]
    fn test_simple_programs_compile() {
        for source in [
            "let x = 1 + 2 * 3",
            "fn add a b = a + b\ndebug add(2, 3)",
            "data Option = None | Some v",
            "fn f n = if n == 0 0 else n + f(n - 1)",
            "let s = \"a%(1 + 2)b\"",
            "while false {\ndebug 1\n}",
            "import \"list\"",
            "fn pick o = match o | 0 = true | fallthrough = false ;",
        ] {
            assert!(try_compile(source).is_ok(), "failed to compile: {source}");
        }
    }

    #[test]
    fn test_global_reassignment_is_rejected() {
        let error = first_error("let x = 1\nx = 2");
        assert_eq!(error.kind, CompileErrorKind::Parse);
        assert!(error.message.contains("Cannot reassign global variable"));
        assert_eq!(error.line, 2);
    }

    #[test]
    fn test_local_redeclaration_is_rejected() {
        let error = first_error("{\nlet a = 1\nlet a = 2\n}");
        assert!(error.message.contains("already declared"));
    }

    #[test]
    fn test_read_in_own_initializer_is_rejected() {
        let error = first_error("{\nlet a = a\n}");
        assert!(error.message.contains("own initializer"));
    }

    #[test]
    fn test_lex_errors_are_collected() {
        let error = first_error("let s = \"abc");
        assert_eq!(error.kind, CompileErrorKind::Lex);
        assert!(error.message.contains("Unterminated string"));
    }

    #[test]
    fn test_missing_function_body() {
        let error = first_error("fn broken a b\ndebug 1");
        assert!(error.message.contains("Missing function body"));
    }

    #[test]
    fn test_too_many_constants_in_one_function() {
        // Every `debug n` adds one number constant to the top-level chunk.
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("debug {i}.5\n"));
        }
        let error = first_error(&source);
        assert!(error.message.contains("Too many constants"));
    }

    #[test]
    fn test_error_reports_module_and_line() {
        let error = first_error("let x = 1\nlet = 2");
        assert_eq!(error.module, "main");
        assert_eq!(error.line, 2);
    }
}
