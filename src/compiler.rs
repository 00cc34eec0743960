// Single-pass Pratt-parsing compiler: no AST, tokens are consumed directly
// into bytecode. Grounded on original_source/Loxcpp/Compiler.cpp/.h for the
// parse-rule table, scope/local/upvalue resolution (resolveLocal,
// declareVariable/addLocal, markInitialized/defineVariable) and error
// recovery (errorAt/synchronize); grounded on the teacher's src/compiler.rs
// for the overall "dispatch straight into bytecode, no intermediate tree"
// idiom its own (unused) compiler skeleton already followed. Functions,
// closures, classes and `match` aren't in the Compiler.cpp snapshot this was
// grounded on (it predates them) and follow spec.md's prose directly.

use crate::chunk::{Chunk, OpCode};
use crate::errors::CompileError;
use crate::heap::Heap;
use crate::lexer::{Scanner, Token, TokenKind};
use crate::object::ObjRef;
use crate::table::Table;
use crate::value::Value;

#[derive(Clone, Copy, PartialEq, PartialOrd)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Range,      // ..
    Term,       // + -
    Factor,     // * / %
    Unary,      // ! -
    Call,       // . () []
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
            Precedence::Comparison => Precedence::Range,
            Precedence::Range => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn = fn(&mut Compiler, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn rule(kind: TokenKind) -> ParseRule {
    use TokenKind::*;
    let (prefix, infix, prec) = match kind {
        LeftParen => (Some(Compiler::grouping as ParseFn), Some(Compiler::call as ParseFn), Precedence::Call),
        LeftBracket => {
            (Some(Compiler::list_literal as ParseFn), Some(Compiler::subscript as ParseFn), Precedence::Call)
        }
        Dot => (None, Some(Compiler::dot as ParseFn), Precedence::Call),
        DotDot => (None, Some(Compiler::range as ParseFn), Precedence::Range),
        Minus => (Some(Compiler::unary as ParseFn), Some(Compiler::binary as ParseFn), Precedence::Term),
        Plus => (None, Some(Compiler::binary as ParseFn), Precedence::Term),
        Slash => (None, Some(Compiler::binary as ParseFn), Precedence::Factor),
        Star => (None, Some(Compiler::binary as ParseFn), Precedence::Factor),
        Percent => (None, Some(Compiler::binary as ParseFn), Precedence::Factor),
        Bang => (Some(Compiler::unary as ParseFn), None, Precedence::None),
        BangEqual => (None, Some(Compiler::binary as ParseFn), Precedence::Equality),
        EqualEqual => (None, Some(Compiler::binary as ParseFn), Precedence::Equality),
        Greater => (None, Some(Compiler::binary as ParseFn), Precedence::Comparison),
        GreaterEqual => (None, Some(Compiler::binary as ParseFn), Precedence::Comparison),
        Less => (None, Some(Compiler::binary as ParseFn), Precedence::Comparison),
        LessEqual => (None, Some(Compiler::binary as ParseFn), Precedence::Comparison),
        Identifier => (Some(Compiler::variable as ParseFn), None, Precedence::None),
        String => (Some(Compiler::string as ParseFn), None, Precedence::None),
        Number => (Some(Compiler::number as ParseFn), None, Precedence::None),
        And => (None, Some(Compiler::and_ as ParseFn), Precedence::And),
        Or => (None, Some(Compiler::or_ as ParseFn), Precedence::Or),
        False | True | Nil => (Some(Compiler::literal as ParseFn), None, Precedence::None),
        This => (Some(Compiler::this_ as ParseFn), None, Precedence::None),
        Super => (Some(Compiler::super_ as ParseFn), None, Precedence::None),
        _ => (None, None, Precedence::None),
    };
    ParseRule { prefix, infix, precedence: prec }
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_const: bool,
    is_captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueInfo {
    index: u8,
    is_local: bool,
    is_const: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct FunctionScope<'src> {
    function: ObjRef,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueInfo>,
    scope_depth: i32,
}

pub struct CompileOutput {
    pub function: ObjRef,
    pub errors: Vec<CompileError>,
}

pub struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    lookahead: Option<Token<'src>>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    scopes: Vec<FunctionScope<'src>>,
    heap: &'h mut Heap,
    const_globals: &'h mut Table,
    protect: Vec<Value>,
}

pub fn compile(source: &str, heap: &mut Heap, const_globals: &mut Table) -> CompileOutput {
    let dummy = Token::synthetic(TokenKind::Eof, "", 0);
    let top_function = heap.new_function();

    let mut compiler = Compiler {
        scanner: Scanner::new(source),
        previous: dummy,
        current: dummy,
        lookahead: None,
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        scopes: vec![FunctionScope {
            function: top_function,
            kind: FunctionKind::Script,
            locals: vec![Local { name: "", depth: 0, is_const: false, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }],
        heap,
        const_globals,
        protect: Vec::new(),
    };

    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");

    let (function, _upvalues) = compiler.end_compiler();
    CompileOutput { function, errors: compiler.errors }
}

impl<'src, 'h> Compiler<'src, 'h> {
    // ----- token stream -----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lookahead.take().unwrap_or_else(|| self.scanner.scan_token());
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn peek_kind(&mut self) -> TokenKind {
        if self.lookahead.is_none() {
            self.lookahead = Some(self.scanner.scan_token());
        }
        self.lookahead.unwrap().kind
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_tok(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        let tok = self.current;
        self.error_at(tok, message);
    }

    fn error(&mut self, message: &str) {
        let tok = self.previous;
        self.error_at(tok, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        if token.kind == TokenKind::Eof {
            self.errors.push(CompileError::new(token.line, format!("at end: {message}")));
        } else if token.kind == TokenKind::Error {
            self.errors.push(CompileError::new(token.line, message.to_string()));
        } else {
            self.errors.push(CompileError::at(token.line, token.lexeme, message.to_string()));
        }
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
                | TokenKind::Const
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Match => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ----- chunk / function plumbing -----

    fn current_scope(&mut self) -> &mut FunctionScope<'src> {
        self.scopes.last_mut().unwrap()
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_scope().function.as_function_mut().chunk
    }

    fn line(&self) -> u32 {
        self.previous.line
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.line();
        self.current_chunk().write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.line();
        self.current_chunk().write_byte(byte, line);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.line();
        let index = self.current_chunk().add_constant(value);
        self.current_chunk().write_op_with_index(OpCode::Constant, OpCode::ConstantLong, index, line);
    }

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            let compiler_functions: Vec<ObjRef> = self.scopes.iter().map(|s| s.function).collect();
            let roots = crate::heap::Roots {
                stack: &[],
                frames: &[],
                open_upvalues: &[],
                globals: &*self.const_globals,
                compiler_functions: &compiler_functions,
            };
            self.heap.collect(roots);
        }
    }

    fn intern(&mut self, s: &str) -> ObjRef {
        self.maybe_collect();
        self.heap.copy_string(s, &mut self.protect)
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        let obj = self.intern(name);
        self.current_chunk().add_constant(Value::Obj(obj))
    }

    fn end_compiler(&mut self) -> (ObjRef, Vec<UpvalueInfo>) {
        // implicit return
        let is_init = self.current_scope().kind == FunctionKind::Initializer;
        if is_init {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);

        let scope = self.scopes.pop().unwrap();
        let upvalue_count = scope.upvalues.len();
        scope.function.as_function_mut().upvalue_count = upvalue_count;

        if crate::heap::stress_gc() || std::env::var("RUFF_PRINT_CODE").is_ok() {
            crate::disassembler::disassemble(
                &scope.function.as_function().chunk,
                &function_display_name(scope.function),
            );
        }

        (scope.function, scope.upvalues)
    }

    fn begin_scope(&mut self) {
        self.current_scope().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_scope().scope_depth -= 1;
        let depth = self.current_scope().scope_depth;
        while let Some(local) = self.current_scope().locals.last() {
            if local.depth <= depth {
                break;
            }
            if self.current_scope().locals.last().unwrap().is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_scope().locals.pop();
        }
    }

    // ----- declarations -----

    fn declaration(&mut self) {
        if self.match_tok(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_tok(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_tok(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.match_tok(TokenKind::Const) {
            self.var_declaration(true);
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let name_tok = self.previous;
        let name_constant = self.identifier_constant(name_tok.lexeme);
        self.declare_variable(name_tok.lexeme, false);

        let line = self.line();
        self.current_chunk().write_op_with_index(OpCode::Class, OpCode::ClassLong, name_constant, line);
        self.define_variable(name_constant, name_tok.lexeme, false);

        self.named_variable_read(name_tok.lexeme);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name_tok = self.previous;
        let name_constant = self.identifier_constant(name_tok.lexeme);
        let kind =
            if name_tok.lexeme == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind, name_tok.lexeme);
        let line = self.line();
        self.current_chunk().write_op_with_index(OpCode::Method, OpCode::MethodLong, name_constant, line);
    }

    fn fun_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect function name.");
        let name_tok = self.previous;
        let global = self.parse_variable_at(name_tok, false);
        self.mark_initialized();
        self.function(FunctionKind::Function, name_tok.lexeme);
        self.define_variable(global, name_tok.lexeme, false);
    }

    fn function(&mut self, kind: FunctionKind, name: &str) {
        let func_obj = self.heap.new_function();
        let name_obj = self.intern(name);
        func_obj.as_function_mut().name = Some(name_obj);

        self.scopes.push(FunctionScope {
            function: func_obj,
            kind,
            locals: vec![Local {
                name: if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
                    "this"
                } else {
                    ""
                },
                depth: 0,
                is_const: true,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        });
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = self.current_scope().function.as_function().arity;
                if arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.current_scope().function.as_function_mut().arity += 1;
                self.consume(TokenKind::Identifier, "Expect parameter name.");
                let param_tok = self.previous;
                let slot = self.parse_variable_at(param_tok, false);
                self.define_variable(slot, param_tok.lexeme, false);
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();

        let line = self.line();
        let index = self.current_chunk().add_constant(Value::Obj(function));
        self.current_chunk().write_op_with_index(OpCode::Closure, OpCode::ClosureLong, index, line);
        for up in upvalues {
            self.emit_byte(up.is_local as u8);
            self.emit_byte(up.index);
        }
    }

    fn var_declaration(&mut self, is_const: bool) {
        self.consume(TokenKind::Identifier, "Expect variable name.");
        let name_tok = self.previous;
        let global = self.parse_variable_at(name_tok, is_const);

        if self.match_tok(TokenKind::Equal) {
            self.expression();
        } else if is_const {
            self.error("Const declaration requires an initializer.");
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global, name_tok.lexeme, is_const);
    }

    // ----- statements -----

    fn statement(&mut self) {
        if self.match_tok(TokenKind::Print) {
            self.print_statement();
        } else if self.match_tok(TokenKind::If) {
            self.if_statement();
        } else if self.match_tok(TokenKind::While) {
            self.while_statement();
        } else if self.match_tok(TokenKind::For) {
            self.for_statement();
        } else if self.match_tok(TokenKind::Return) {
            self.return_statement();
        } else if self.match_tok(TokenKind::Match) {
            self.match_statement();
        } else if self.check(TokenKind::Identifier) && self.peek_kind() == TokenKind::PlusPlus {
            self.increment_statement();
        } else if self.match_tok(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
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

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let line = self.line();
        let then_jump = self.current_chunk().emit_jump_placeholder(OpCode::JumpIfFalse, line);
        self.emit_op(OpCode::Pop);
        self.statement();

        let line = self.line();
        let else_jump = self.current_chunk().emit_jump_placeholder(OpCode::Jump, line);
        if let Err(msg) = self.current_chunk().patch_jump(then_jump) {
            self.error(msg);
        }
        self.emit_op(OpCode::Pop);

        if self.match_tok(TokenKind::Else) {
            self.statement();
        }
        if let Err(msg) = self.current_chunk().patch_jump(else_jump) {
            self.error(msg);
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let line = self.line();
        let exit_jump = self.current_chunk().emit_jump_placeholder(OpCode::JumpIfFalse, line);
        self.emit_op(OpCode::Pop);
        self.statement();
        let line = self.line();
        if let Err(msg) = self.current_chunk().emit_loop(loop_start, line) {
            self.error(msg);
        }

        if let Err(msg) = self.current_chunk().patch_jump(exit_jump) {
            self.error(msg);
        }
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_tok(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_tok(TokenKind::Var) {
            self.var_declaration(false);
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_tok(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            let line = self.line();
            exit_jump = Some(self.current_chunk().emit_jump_placeholder(OpCode::JumpIfFalse, line));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_tok(TokenKind::RightParen) {
            let line = self.line();
            let body_jump = self.current_chunk().emit_jump_placeholder(OpCode::Jump, line);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            let line = self.line();
            if let Err(msg) = self.current_chunk().emit_loop(loop_start, line) {
                self.error(msg);
            }
            loop_start = increment_start;
            if let Err(msg) = self.current_chunk().patch_jump(body_jump) {
                self.error(msg);
            }
        }

        self.statement();
        let line = self.line();
        if let Err(msg) = self.current_chunk().emit_loop(loop_start, line) {
            self.error(msg);
        }

        if let Some(exit) = exit_jump {
            if let Err(msg) = self.current_chunk().patch_jump(exit) {
                self.error(msg);
            }
            self.emit_op(OpCode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.current_scope().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_tok(TokenKind::Semicolon) {
            self.emit_return_nil_or_this();
        } else {
            if self.current_scope().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    /// `identifier++;` reads the variable, bumps it with `OP_INCREMENT`, writes
    /// it back and discards the resulting value (it's a statement, not an
    /// expression). Needs the one token of lookahead buffered in
    /// `self.lookahead` to tell this apart from a bare identifier
    /// expression-statement.
    fn increment_statement(&mut self) {
        self.advance(); // previous = identifier
        let name = self.previous.lexeme;
        self.advance(); // previous = '++'
        self.consume(TokenKind::Semicolon, "Expect ';' after increment statement.");
        self.emit_increment(name);
    }

    fn emit_increment(&mut self, name: &str) {
        let scope_idx = self.scopes.len() - 1;
        let line = self.line();

        if let Some((slot, is_const)) = self.resolve_local(scope_idx, name) {
            if is_const {
                self.error("Cannot assign to a const variable.");
            }
            self.current_chunk().write_op_with_index(OpCode::GetLocal, OpCode::GetLocalLong, slot, line);
            self.emit_op(OpCode::Increment);
            self.current_chunk().write_op_with_index(OpCode::SetLocal, OpCode::SetLocalLong, slot, line);
            self.emit_op(OpCode::Pop);
            return;
        }

        if let Some((slot, is_const)) = self.resolve_upvalue(scope_idx, name) {
            if is_const {
                self.error("Cannot assign to a const variable.");
            }
            self.emit_op(OpCode::GetUpvalue);
            self.emit_byte(slot);
            self.emit_op(OpCode::Increment);
            self.emit_op(OpCode::SetUpvalue);
            self.emit_byte(slot);
            self.emit_op(OpCode::Pop);
            return;
        }

        let global = self.identifier_constant(name);
        let is_const_global = {
            let obj = self.intern(name);
            self.const_globals.get(obj).is_some()
        };
        if is_const_global {
            self.error("Cannot assign to a const variable.");
        }
        let line = self.line();
        self.current_chunk().write_op_with_index(OpCode::GetGlobal, OpCode::GetGlobalLong, global, line);
        self.emit_op(OpCode::Increment);
        self.current_chunk().write_op_with_index(OpCode::SetGlobal, OpCode::SetGlobalLong, global, line);
        self.emit_op(OpCode::Pop);
    }

    fn emit_return_nil_or_this(&mut self) {
        if self.current_scope().kind == FunctionKind::Initializer {
            self.emit_op(OpCode::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Compiles `match (subject) { pattern => stmt, ..., _ => stmt }`.
    /// The subject is evaluated once and kept alive as a synthetic local for
    /// the arms to read; `OP_MATCH` compares that local against each arm's
    /// pattern (range-containment for `Range` patterns, structural equality
    /// otherwise). `_` is a wildcard that must be the final arm.
    fn match_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'match'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after match subject.");

        self.current_scope().locals.push(Local { name: "", depth: self.current_scope().scope_depth, is_const: true, is_captured: false });
        let subject_slot = self.current_scope().locals.len() - 1;

        self.consume(TokenKind::LeftBrace, "Expect '{' before match body.");

        let mut end_jumps = Vec::new();
        let mut seen_wildcard = false;
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if seen_wildcard {
                self.error("wildcard arm must be last");
            }
            let is_wildcard = self.check(TokenKind::Identifier) && self.current.lexeme == "_";
            if is_wildcard {
                seen_wildcard = true;
                self.advance();
                self.consume_fat_arrow();
                self.match_arm_body();
            } else {
                self.emit_get_local_slot(subject_slot);
                self.parse_precedence(Precedence::Or);
                self.emit_op(OpCode::Match);
                let line = self.line();
                let arm_false = self.current_chunk().emit_jump_placeholder(OpCode::JumpIfFalse, line);
                self.emit_op(OpCode::Pop);
                self.consume_fat_arrow();
                self.match_arm_body();
                let line = self.line();
                let end_jump = self.current_chunk().emit_jump_placeholder(OpCode::Jump, line);
                end_jumps.push(end_jump);
                if let Err(msg) = self.current_chunk().patch_jump(arm_false) {
                    self.error(msg);
                }
                self.emit_op(OpCode::Pop);
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after match body.");

        for jump in end_jumps {
            if let Err(msg) = self.current_chunk().patch_jump(jump) {
                self.error(msg);
            }
        }

        self.end_scope();
    }

    fn consume_fat_arrow(&mut self) {
        if self.check(TokenKind::Equal) && self.peek_kind() == TokenKind::Greater {
            self.advance();
            self.advance();
        } else {
            self.error_at_current("Expect '=>' after match pattern.");
        }
    }

    fn match_arm_body(&mut self) {
        self.statement();
    }

    fn emit_get_local_slot(&mut self, slot: usize) {
        let line = self.line();
        self.current_chunk().write_op_with_index(OpCode::GetLocal, OpCode::GetLocalLong, slot, line);
    }

    // ----- variables -----

    fn parse_variable_at(&mut self, name_tok: Token<'src>, is_const: bool) -> usize {
        self.declare_variable(name_tok.lexeme, is_const);
        if self.current_scope().scope_depth > 0 {
            return 0; // locals don't use the constant pool slot
        }
        self.identifier_constant(name_tok.lexeme)
    }

    fn declare_variable(&mut self, name: &'src str, is_const: bool) {
        if self.current_scope().scope_depth == 0 {
            return;
        }
        let depth = self.current_scope().scope_depth;
        for local in self.current_scope().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
            }
        }
        self.add_local(name, is_const);
    }

    fn add_local(&mut self, name: &'src str, is_const: bool) {
        self.current_scope().locals.push(Local { name, depth: -1, is_const, is_captured: false });
    }

    fn mark_initialized(&mut self) {
        if self.current_scope().scope_depth == 0 {
            return;
        }
        let depth = self.current_scope().scope_depth;
        self.current_scope().locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: usize, name: &str, is_const: bool) {
        if self.current_scope().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        let line = self.line();
        self.current_chunk().write_op_with_index(OpCode::DefineGlobal, OpCode::DefineGlobalLong, global, line);
        if is_const {
            let obj = self.intern(name);
            self.const_globals.set(obj, Value::Bool(true));
        }
    }

    fn resolve_local(&self, scope_idx: usize, name: &str) -> Option<(usize, bool)> {
        let scope = &self.scopes[scope_idx];
        for (i, local) in scope.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return None; // reported by caller via a fresh error
                }
                return Some((i, local.is_const));
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, scope_idx: usize, name: &str) -> Option<(u8, bool)> {
        if scope_idx == 0 {
            return None;
        }
        let enclosing_idx = scope_idx - 1;
        if let Some((local_idx, is_const)) = self.resolve_local(enclosing_idx, name) {
            self.scopes[enclosing_idx].locals[local_idx].is_captured = true;
            let idx = self.add_upvalue(scope_idx, local_idx as u8, true, is_const);
            return Some((idx, is_const));
        }
        if let Some((up_idx, is_const)) = self.resolve_upvalue(enclosing_idx, name) {
            let idx = self.add_upvalue(scope_idx, up_idx, false, is_const);
            return Some((idx, is_const));
        }
        None
    }

    fn add_upvalue(&mut self, scope_idx: usize, index: u8, is_local: bool, is_const: bool) -> u8 {
        let scope = &mut self.scopes[scope_idx];
        for (i, up) in scope.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        scope.upvalues.push(UpvalueInfo { index, is_local, is_const });
        (scope.upvalues.len() - 1) as u8
    }

    fn named_variable_read(&mut self, name: &str) {
        self.emit_named_variable(name, false);
    }

    fn emit_named_variable(&mut self, name: &str, can_assign: bool) {
        let scope_idx = self.scopes.len() - 1;
        let resolved_local = self.resolve_local(scope_idx, name);
        let line = self.line();

        if let Some((slot, is_const)) = resolved_local {
            if can_assign && self.match_tok(TokenKind::Equal) {
                if is_const {
                    self.error("Cannot assign to a const variable.");
                }
                self.expression();
                self.current_chunk().write_op_with_index(OpCode::SetLocal, OpCode::SetLocalLong, slot, line);
            } else {
                self.current_chunk().write_op_with_index(OpCode::GetLocal, OpCode::GetLocalLong, slot, line);
            }
            return;
        }

        if let Some((slot, is_const)) = self.resolve_upvalue(scope_idx, name) {
            if can_assign && self.match_tok(TokenKind::Equal) {
                if is_const {
                    self.error("Cannot assign to a const variable.");
                }
                self.expression();
                self.emit_op(OpCode::SetUpvalue);
                self.emit_byte(slot);
            } else {
                self.emit_op(OpCode::GetUpvalue);
                self.emit_byte(slot);
            }
            return;
        }

        let global = self.identifier_constant(name);
        let is_const_global = {
            let obj = self.intern(name);
            self.const_globals.get(obj).is_some()
        };
        if can_assign && self.match_tok(TokenKind::Equal) {
            if is_const_global {
                self.error("Cannot assign to a const variable.");
            }
            self.expression();
            self.current_chunk().write_op_with_index(OpCode::SetGlobal, OpCode::SetGlobalLong, global, line);
        } else {
            self.current_chunk().write_op_with_index(OpCode::GetGlobal, OpCode::GetGlobalLong, global, line);
        }
    }

    // ----- expressions -----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix_rule = rule(self.previous.kind).prefix;
        let Some(prefix_rule) = prefix_rule else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix_rule(self, can_assign);

        while precedence <= rule(self.current.kind).precedence {
            self.advance();
            let infix_rule = rule(self.previous.kind).infix.unwrap();
            infix_rule(self, can_assign);
        }

        if can_assign && self.match_tok(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let value: f64 = lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let inner = &lexeme[1..lexeme.len() - 1];
        let obj = self.intern(inner);
        self.emit_constant(Value::Obj(obj));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op_kind = self.previous.kind;
        let next_prec = rule(op_kind).precedence.next();
        self.parse_precedence(next_prec);
        match op_kind {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::Percent => self.emit_op(OpCode::Modulo),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn range(&mut self, _can_assign: bool) {
        self.parse_precedence(Precedence::Range.next());
        self.emit_op(OpCode::BuildRange);
    }

    fn and_(&mut self, _can_assign: bool) {
        let line = self.line();
        let end_jump = self.current_chunk().emit_jump_placeholder(OpCode::JumpIfFalse, line);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        if let Err(msg) = self.current_chunk().patch_jump(end_jump) {
            self.error(msg);
        }
    }

    fn or_(&mut self, _can_assign: bool) {
        let line = self.line();
        let else_jump = self.current_chunk().emit_jump_placeholder(OpCode::JumpIfFalse, line);
        let end_jump = self.current_chunk().emit_jump_placeholder(OpCode::Jump, line);
        if let Err(msg) = self.current_chunk().patch_jump(else_jump) {
            self.error(msg);
        }
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        if let Err(msg) = self.current_chunk().patch_jump(end_jump) {
            self.error(msg);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        if can_assign && name == "_" {
            self.error("Cannot use wildcard '_' as a variable.");
        }
        self.emit_named_variable(name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        let kind = self.current_scope().kind;
        if kind != FunctionKind::Method && kind != FunctionKind::Initializer {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.emit_named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        self.error("Can't use 'super' outside of a subclass.");
        if self.match_tok(TokenKind::Dot) {
            self.consume(TokenKind::Identifier, "Expect superclass method name.");
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name_tok = self.previous;
        let name_constant = self.identifier_constant(name_tok.lexeme);
        let line = self.line();

        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression();
            self.current_chunk().write_op_with_index(
                OpCode::SetProperty,
                OpCode::SetPropertyLong,
                name_constant,
                line,
            );
        } else if self.match_tok(TokenKind::LeftParen) {
            let argc = self.argument_list();
            let line = self.line();
            self.current_chunk().write_op_with_index(OpCode::Invoke, OpCode::InvokeLong, name_constant, line);
            self.emit_byte(argc);
        } else {
            self.current_chunk().write_op_with_index(
                OpCode::GetProperty,
                OpCode::GetPropertyLong,
                name_constant,
                line,
            );
        }
    }

    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']' after index.");
        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression();
            self.emit_op(OpCode::StoreSubscr);
        } else {
            self.emit_op(OpCode::IndexSubscr);
        }
    }

    fn list_literal(&mut self, _can_assign: bool) {
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                if count == 255 {
                    self.error("Can't have more than 255 elements in a list literal.");
                }
                self.expression();
                count += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after list elements.");
        self.emit_op(OpCode::BuildList);
        self.emit_byte(count as u8);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }
}

fn function_display_name(function: ObjRef) -> String {
    match function.as_function().name {
        Some(name) => name.as_string().as_str().to_string(),
        None => "<script>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(src: &str) -> (ObjRef, Heap, Table) {
        let mut heap = Heap::new();
        let mut const_globals = Table::new();
        let output = compile(src, &mut heap, &mut const_globals);
        assert!(output.errors.is_empty(), "unexpected errors: {:?}", output.errors.iter().map(|e| e.message.clone()).collect::<Vec<_>>());
        (output.function, heap, const_globals)
    }

    #[test]
    fn compiles_trivial_expression_statement() {
        compile_ok("1 + 2;");
    }

    #[test]
    fn compiles_var_and_print() {
        compile_ok("var x = 1; print x;");
    }

    #[test]
    fn redeclared_local_is_an_error() {
        let mut heap = Heap::new();
        let mut const_globals = Table::new();
        let output = compile("{ var a = 1; var a = 2; }", &mut heap, &mut const_globals);
        assert!(!output.errors.is_empty());
    }

    #[test]
    fn const_reassignment_is_an_error() {
        let mut heap = Heap::new();
        let mut const_globals = Table::new();
        let output = compile("const a = 1; a = 2;", &mut heap, &mut const_globals);
        assert!(!output.errors.is_empty());
    }

    #[test]
    fn wildcard_not_last_is_an_error() {
        let mut heap = Heap::new();
        let mut const_globals = Table::new();
        let output = compile("match (1) { _ => print 1; 2 => print 2; }", &mut heap, &mut const_globals);
        assert!(!output.errors.is_empty());
    }

    #[test]
    fn function_and_closure_compile() {
        compile_ok("fun make() { var x = 1; fun inner() { return x; } return inner; } make();");
    }

    #[test]
    fn class_and_method_compile() {
        compile_ok("class Foo { bar() { return this; } } var f = Foo(); f.bar();");
    }

    #[test]
    fn increment_statement_compiles() {
        compile_ok("var i = 0; i++; print i;");
    }

    #[test]
    fn bare_identifier_statement_still_compiles() {
        compile_ok("var i = 0; i; print i;");
    }

    #[test]
    fn match_statement_compiles() {
        compile_ok("match (1) { 1 => print \"one\"; _ => print \"other\"; }");
    }

    #[test]
    fn super_outside_subclass_is_an_error() {
        let mut heap = Heap::new();
        let mut const_globals = Table::new();
        let output = compile("class Foo { bar() { return super.bar(); } }", &mut heap, &mut const_globals);
        assert!(!output.errors.is_empty());
    }
}
