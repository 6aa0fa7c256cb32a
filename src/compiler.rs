// File: src/compiler.rs
//
// Single-pass bytecode compiler for Cinder.
// A Pratt parser pulls tokens straight off the scanner and writes opcodes
// into the chunk of the function being built; there is no AST. Nested
// function declarations push a fresh compile context, so the context stack
// mirrors the lexical nesting of the source.

use once_cell::sync::Lazy;

use crate::bytecode::{Chunk, OpCode};
use crate::debug;
use crate::memory::Heap;
use crate::object::{ObjFunction, ObjRef};
use crate::scanner::{Dialect, Scanner, Token, TokenKind};
use crate::value::Value;

/// Compiles a source string into the top-level script function. Errors have
/// already been reported to stderr when this returns `None`.
pub fn compile(source: &str, heap: &mut Heap, dialect: Dialect) -> Option<ObjRef> {
    let mut compiler = Compiler::new(source, heap, dialect);
    compiler.push_context(FunctionKind::Script);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let (function, _) = compiler.pop_context();
    if compiler.had_error {
        None
    } else {
        Some(function)
    }
}

static PRINT_CODE: Lazy<bool> = Lazy::new(|| std::env::var("CINDER_PRINT_CODE").is_ok());

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Expression precedence, lowest to highest. The discriminant order is what
/// the climb loop in `parse_precedence` compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

/// One row of the Pratt table: how a token parses in prefix position, in
/// infix position, and how tightly it binds as an infix operator.
#[derive(Clone, Copy)]
struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

fn get_rule<'src, 'h>(kind: TokenKind) -> ParseRule<'src, 'h> {
    let rule = |prefix, infix, precedence| ParseRule { prefix, infix, precedence };
    match kind {
        TokenKind::LeftParen => {
            rule(Some(Compiler::grouping as ParseFn), Some(Compiler::call), Precedence::Call)
        }
        TokenKind::Minus => {
            rule(Some(Compiler::unary as ParseFn), Some(Compiler::binary), Precedence::Term)
        }
        TokenKind::Plus => rule(None, Some(Compiler::binary as ParseFn), Precedence::Term),
        TokenKind::Slash | TokenKind::Star => {
            rule(None, Some(Compiler::binary as ParseFn), Precedence::Factor)
        }
        TokenKind::Bang => rule(Some(Compiler::unary as ParseFn), None, Precedence::None),
        TokenKind::BangEqual | TokenKind::EqualEqual => {
            rule(None, Some(Compiler::binary as ParseFn), Precedence::Equality)
        }
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => {
            rule(None, Some(Compiler::binary as ParseFn), Precedence::Comparison)
        }
        TokenKind::Identifier => rule(Some(Compiler::variable as ParseFn), None, Precedence::None),
        TokenKind::String => rule(Some(Compiler::string as ParseFn), None, Precedence::None),
        TokenKind::Number => rule(Some(Compiler::number as ParseFn), None, Precedence::None),
        TokenKind::And => rule(None, Some(Compiler::and_ as ParseFn), Precedence::And),
        TokenKind::Or => rule(None, Some(Compiler::or_ as ParseFn), Precedence::Or),
        TokenKind::True | TokenKind::False | TokenKind::Nil => {
            rule(Some(Compiler::literal as ParseFn), None, Precedence::None)
        }
        // Everything else (punctuation, statement keywords, the reserved
        // sizeof token) has no expression role.
        _ => rule(None, None, Precedence::None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while declared but not yet initialized so the
    /// initializer cannot read the variable it is defining.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct CompiledUpvalue {
    index: u8,
    is_local: bool,
}

/// Per-function compile state. The stack of these is the lexical chain of
/// functions being compiled; index 0 is the script.
struct FnContext<'src> {
    kind: FunctionKind,
    chunk: Chunk,
    name: Option<ObjRef>,
    arity: usize,
    upvalues: Vec<CompiledUpvalue>,
    locals: Vec<Local<'src>>,
    scope_depth: i32,
}

struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    heap: &'h mut Heap,
    contexts: Vec<FnContext<'src>>,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap, dialect: Dialect) -> Self {
        let placeholder = Token { kind: TokenKind::Eof, lexeme: "", line: 1 };
        Compiler {
            scanner: Scanner::new(source, dialect),
            current: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            heap,
            contexts: Vec::new(),
        }
    }

    fn push_context(&mut self, kind: FunctionKind) {
        // The function's name token is the previous token when this is
        // called from a declaration; the script has no name.
        let name = match kind {
            FunctionKind::Script => None,
            FunctionKind::Function => Some(self.heap.copy_string(self.previous.lexeme)),
        };
        let mut locals = Vec::with_capacity(8);
        // Slot 0 belongs to the callee itself and is invisible to lookups.
        locals.push(Local { name: "", depth: 0, is_captured: false });
        self.contexts.push(FnContext {
            kind,
            chunk: Chunk::new(),
            name,
            arity: 0,
            upvalues: Vec::new(),
            locals,
            scope_depth: 0,
        });
    }

    /// Seals the current function: emits the implicit return, moves the
    /// finished chunk into a heap-allocated function object, and hands back
    /// the capture descriptors the enclosing function must emit.
    fn pop_context(&mut self) -> (ObjRef, Vec<CompiledUpvalue>) {
        self.emit_return();
        let ctx = self.contexts.pop().expect("no compile context");

        if *PRINT_CODE && !self.had_error {
            let name = match ctx.name {
                Some(name) => self.heap.string(name).to_string(),
                None => "<script>".to_string(),
            };
            debug::disassemble_chunk(&ctx.chunk, &name, self.heap);
        }

        let function = self.heap.new_function(ObjFunction {
            arity: ctx.arity,
            upvalue_count: ctx.upvalues.len(),
            chunk: ctx.chunk,
            name: ctx.name,
        });
        (function, ctx.upvalues)
    }

    fn ctx(&self) -> &FnContext<'src> {
        self.contexts.last().expect("no compile context")
    }

    fn ctx_mut(&mut self) -> &mut FnContext<'src> {
        self.contexts.last_mut().expect("no compile context")
    }

    // === Token plumbing ===

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme;
            self.error_at(self.current, message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at(self.current, message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // === Error reporting ===

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    /// Reports one diagnostic per panic window; everything after the first
    /// error is suppressed until `synchronize` finds a statement boundary.
    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => eprint!(" at end"),
            // Error tokens carry the message as their lexeme already.
            TokenKind::Error => {}
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {}", message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // === Bytecode emission ===

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.ctx_mut().chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    fn emit_op_byte(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        // Falling off the end of any function yields nil.
        self.emit_ops(OpCode::Nil, OpCode::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op_byte(OpCode::Constant, index);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        match self.ctx_mut().chunk.add_constant(value) {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    /// Emits a jump with a two-byte placeholder and returns the placeholder
    /// offset for `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.ctx().chunk.code.len() - 2
    }

    /// Back-patches a forward jump to land on the next instruction emitted
    /// after this call.
    fn patch_jump(&mut self, offset: usize) {
        let jump = self.ctx().chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let bytes = (jump as u16).to_be_bytes();
        let chunk = &mut self.ctx_mut().chunk;
        chunk.code[offset] = bytes[0];
        chunk.code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        // +2 skips over the operand itself.
        let offset = self.ctx().chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    // === Declarations and statements ===

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Initialized before the body compiles so the function can call
        // itself recursively.
        self.mark_initialized();
        self.function();
        self.define_variable(global);
    }

    fn function(&mut self) {
        self.push_context(FunctionKind::Function);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.ctx_mut().arity += 1;
                if self.ctx().arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No matching end_scope: popping the context discards its locals,
        // and the runtime discards the frame's stack window on return.
        let (function, upvalues) = self.pop_context();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_byte(OpCode::Closure, constant);
        for upvalue in upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.ctx().chunk.code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    /// Compiles `for` by rewiring jumps rather than desugaring through any
    /// intermediate form: the increment clause compiles before the body in
    /// the bytecode, so the body jumps back to the increment and the
    /// increment loops back to the condition.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.ctx().chunk.code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.ctx().chunk.code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.ctx().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.ctx_mut().scope_depth += 1;
    }

    /// Pops every local belonging to the exiting scope. Captured locals are
    /// closed instead of discarded so closures keep seeing them.
    fn end_scope(&mut self) {
        self.ctx_mut().scope_depth -= 1;

        loop {
            let ctx = self.ctx();
            let Some(local) = ctx.locals.last() else { break };
            if local.depth <= ctx.scope_depth {
                break;
            }
            let op = if local.is_captured { OpCode::CloseUpvalue } else { OpCode::Pop };
            self.emit_op(op);
            self.ctx_mut().locals.pop();
        }
    }

    // === Variables ===

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);

        self.declare_variable();
        if self.ctx().scope_depth > 0 {
            // Locals live on the stack; there is no name constant to emit.
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    /// Interns `name` and returns its index in the constant pool, reusing an
    /// existing entry when the same name already appears in this chunk.
    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.heap.copy_string(name);
        let existing = self
            .ctx()
            .chunk
            .constants
            .iter()
            .position(|&c| c == Value::Obj(interned));
        match existing {
            Some(index) => index as u8,
            None => self.make_constant(Value::Obj(interned)),
        }
    }

    fn declare_variable(&mut self) {
        if self.ctx().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;

        let mut shadow_error = false;
        {
            let ctx = self.ctx();
            for local in ctx.locals.iter().rev() {
                if local.depth != -1 && local.depth < ctx.scope_depth {
                    break;
                }
                if local.name == name {
                    shadow_error = true;
                    break;
                }
            }
        }
        if shadow_error {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.ctx().locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        // Depth -1 marks "declared but not initialized" until the
        // initializer finishes.
        self.ctx_mut().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.ctx().scope_depth == 0 {
            return;
        }
        let depth = self.ctx().scope_depth;
        if let Some(local) = self.ctx_mut().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.ctx().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_byte(OpCode::DefineGlobal, global);
    }

    /// Resolves `name` in the locals of context `ctx_index`. Reading a local
    /// inside its own initializer is an error.
    fn resolve_local(&mut self, ctx_index: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        for (i, local) in self.contexts[ctx_index].locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(i as u8);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    /// Resolves `name` as a variable captured from an enclosing function,
    /// threading the capture through every function in between. The local
    /// ultimately captured is flagged so scope exit closes it.
    fn resolve_upvalue(&mut self, ctx_index: usize, name: &str) -> Option<u8> {
        if ctx_index == 0 {
            return None;
        }

        if let Some(local) = self.resolve_local(ctx_index - 1, name) {
            self.contexts[ctx_index - 1].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(ctx_index, local, true));
        }

        if let Some(upvalue) = self.resolve_upvalue(ctx_index - 1, name) {
            return Some(self.add_upvalue(ctx_index, upvalue, false));
        }

        None
    }

    fn add_upvalue(&mut self, ctx_index: usize, index: u8, is_local: bool) -> u8 {
        let candidate = CompiledUpvalue { index, is_local };
        let upvalues = &self.contexts[ctx_index].upvalues;

        // A function referencing the same outer variable twice shares one
        // upvalue slot.
        if let Some(existing) = upvalues.iter().position(|&u| u == candidate) {
            return existing as u8;
        }

        if upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.contexts[ctx_index].upvalues.push(candidate);
        (self.contexts[ctx_index].upvalues.len() - 1) as u8
    }

    // === Expressions ===

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// The Pratt climb: run the prefix rule for the token just consumed,
    /// then fold in every infix operator binding at least as tightly as
    /// `precedence`.
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = get_rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        // Assignment may only happen at the lowest expression precedence,
        // and only the prefix target just parsed may consume the '='.
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = get_rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        // Compile the operand first; the operator applies to its result.
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = get_rule(operator);
        self.parse_precedence(rule.precedence.next());

        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op_byte(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count.min(255) as u8
    }

    /// Short-circuit `and`: when the left side is falsy the right side is
    /// skipped and the falsy value is the result.
    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    /// Short-circuit `or`: a truthy left side survives as the result.
    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);

        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        // Trim the surrounding quotes.
        let interned = self.heap.copy_string(&lexeme[1..lexeme.len() - 1]);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    /// Emits the load or store for a name: local slot, upvalue, or global
    /// looked up by name at runtime, in that order.
    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let top = self.contexts.len() - 1;
        let (get_op, set_op, arg) = if let Some(index) = self.resolve_local(top, name.lexeme) {
            (OpCode::GetLocal, OpCode::SetLocal, index)
        } else if let Some(index) = self.resolve_upvalue(top, name.lexeme) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let index = self.identifier_constant(name.lexeme);
            (OpCode::GetGlobal, OpCode::SetGlobal, index)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap, Dialect::Standard)
            .expect("expected source to compile");
        (heap, function)
    }

    fn compile_err(source: &str) -> bool {
        let mut heap = Heap::new();
        compile(source, &mut heap, Dialect::Standard).is_none()
    }

    fn ops(chunk: &Chunk) -> Vec<OpCode> {
        // Walks code skipping operand bytes; enough for shape assertions on
        // chunks without Closure trailers.
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = OpCode::try_from(chunk.code[offset]).expect("bad opcode");
            out.push(op);
            offset += 1 + match op {
                OpCode::Constant
                | OpCode::GetLocal
                | OpCode::SetLocal
                | OpCode::GetGlobal
                | OpCode::DefineGlobal
                | OpCode::SetGlobal
                | OpCode::GetUpvalue
                | OpCode::SetUpvalue
                | OpCode::Call
                | OpCode::Closure => 1,
                OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => 2,
                _ => 0,
            };
        }
        out
    }

    #[test]
    fn expression_statement_compiles_to_constant_pop() {
        let (heap, function) = compile_ok("1 + 2 * 3;");
        let chunk = &heap.as_function(function).chunk;
        assert_eq!(
            ops(chunk),
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Multiply,
                OpCode::Add,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn comparison_operators_compose_from_three_primitives() {
        let (heap, function) = compile_ok("1 <= 2;");
        let chunk = &heap.as_function(function).chunk;
        assert_eq!(
            ops(chunk),
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Greater,
                OpCode::Not,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
    }

    #[test]
    fn forward_jump_offsets_skip_patched_region() {
        let (heap, function) = compile_ok("if (true) print 1;");
        let chunk = &heap.as_function(function).chunk;
        // First JumpIfFalse operand must land exactly on the else-side Pop.
        let code = &chunk.code;
        let jump_at = code
            .iter()
            .position(|&b| b == u8::from(OpCode::JumpIfFalse))
            .expect("no conditional jump");
        let offset = u16::from_be_bytes([code[jump_at + 1], code[jump_at + 2]]) as usize;
        let target = jump_at + 3 + offset;
        assert_eq!(OpCode::try_from(code[target]), Ok(OpCode::Pop));
    }

    #[test]
    fn global_names_share_constant_pool_entries() {
        let (heap, function) = compile_ok("var a = 1; a; a; a;");
        let chunk = &heap.as_function(function).chunk;
        // One constant for the number, one for the name 'a'.
        assert_eq!(chunk.constants.len(), 2);
    }

    #[test]
    fn nested_function_captures_become_upvalues() {
        let (heap, function) = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        let chunk = &heap.as_function(function).chunk;
        let outer = chunk
            .constants
            .iter()
            .find_map(|&c| match c {
                Value::Obj(r) => match &heap.get(r).kind {
                    crate::object::ObjKind::Function(f) if f.name.is_some() => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("outer function constant");
        let inner = outer
            .chunk
            .constants
            .iter()
            .find_map(|&c| match c {
                Value::Obj(r) => match &heap.get(r).kind {
                    crate::object::ObjKind::Function(f) => Some(f),
                    _ => None,
                },
                _ => None,
            })
            .expect("inner function constant");
        assert_eq!(inner.upvalue_count, 1);
    }

    #[test]
    fn error_cases_fail_to_compile() {
        assert!(compile_err("var 1 = 2;"));
        assert!(compile_err("print;"));
        assert!(compile_err("a + b = c;")); // invalid assignment target
        assert!(compile_err("{ var x = 1; var x = 2; }")); // redeclared in scope
    }

    #[test]
    fn self_read_in_initializer_is_local_only() {
        // Globals may reference themselves; resolution happens at runtime.
        let mut heap = Heap::new();
        assert!(compile("var a = 1; var b = b;", &mut heap, Dialect::Standard).is_some());
        // Locals may not.
        assert!(compile_err("{ var a = a; }"));
    }

    #[test]
    fn return_outside_function_is_rejected() {
        assert!(compile_err("return 1;"));
    }

    #[test]
    fn reserved_sizeof_has_no_expression_role() {
        let mut heap = Heap::new();
        assert!(compile("print howbig(1);", &mut heap, Dialect::Casual).is_none());
    }

    #[test]
    fn natural_dialect_spellings_compile() {
        let mut heap = Heap::new();
        let source = "action greet() { give 1; } store x is greet(); say x matches 1;";
        assert!(compile(source, &mut heap, Dialect::Natural).is_some());
    }
}
