//! §4.2 Compiler — single-pass Pratt parser that emits bytecode directly,
//! with no intermediate AST. One `CompilerState` exists per function
//! currently being compiled; nested functions push a new one and pop back
//! to the enclosing one when done, the same discipline the original
//! `initCompiler`/`endCompiler` pair implements with a C-style linked
//! list of compilers — here expressed as ordinary Rust ownership
//! (`enclosing: Option<Box<_>>`) swapped in with `std::mem::replace`.

use super::chunk::OpCode;
use super::error::CompileError;
use super::object::{FunctionObj, ObjRef};
use super::reporter::{Phase, Report, Reporter};
use super::scanner::Scanner;
use super::token::{Token, TokenKind};
use super::value::Value;
use super::vm::Vm;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_PARAMS: usize = 255;
const MAX_ARGS: usize = 255;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    depth: i32,
    is_captured: bool,
}

struct UpvalueDecl {
    index: u8,
    is_local: bool,
}

struct CompilerState<'src> {
    enclosing: Option<Box<CompilerState<'src>>>,
    /// Allocated on `vm`'s heap the moment this state exists, kept rooted
    /// via `vm.push_compiler_root` for as long as it is `self.current` (or
    /// an ancestor of it) — see `Vm::alloc_function`.
    function: ObjRef,
    function_type: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDecl>,
    scope_depth: i32,
}

impl<'src> CompilerState<'src> {
    fn new(function_type: FunctionType, name: Option<ObjRef>, vm: &mut Vm) -> Self {
        let slot0_name = if matches!(function_type, FunctionType::Method | FunctionType::Initializer)
        {
            "this"
        } else {
            ""
        };
        let function = vm.alloc_function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            name,
            chunk: super::chunk::Chunk::new(),
        });
        Self {
            enclosing: None,
            function,
            function_type,
            locals: vec![Local {
                name: slot0_name,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassCompilerState {
    enclosing: Option<Box<ClassCompilerState>>,
    has_superclass: bool,
}

struct Parser<'src> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str) -> Self {
        let eof = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 0,
        };
        Self {
            scanner: Scanner::new(source),
            previous: eof,
            current: eof,
            had_error: false,
            panic_mode: false,
        }
    }
}

pub struct Compiler<'src, 'vm> {
    parser: Parser<'src>,
    current: CompilerState<'src>,
    current_class: Option<Box<ClassCompilerState>>,
    vm: &'vm mut Vm,
    reporter: &'vm mut dyn Reporter,
}

type PrefixFn<'src, 'vm> = fn(&mut Compiler<'src, 'vm>, bool);
type InfixFn<'src, 'vm> = fn(&mut Compiler<'src, 'vm>, bool);

/// Compiles `source` into a top-level `<script>` function object, or
/// `Err(CompileError)` if any diagnostic was reported. Every function
/// object is rooted via `vm.push_compiler_root` for the whole time it and
/// its nested functions are being built (§4.4 "every compiler in the
/// enclosing chain") — the root is only dropped once the object is either
/// embedded as a constant in its enclosing chunk or, for the top-level
/// script, about to be handed back to a caller that immediately pushes it
/// onto the value stack.
pub fn compile(source: &str, vm: &mut Vm, reporter: &mut dyn Reporter) -> Result<ObjRef, CompileError> {
    let current = CompilerState::new(FunctionType::Script, None, vm);
    let mut compiler = Compiler {
        parser: Parser::new(source),
        current,
        current_class: None,
        vm,
        reporter,
    };
    compiler.vm.push_compiler_root(compiler.current.function);

    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }

    let had_error = compiler.parser.had_error;
    let (function, _) = compiler.end_compiler();
    compiler.vm.pop_compiler_root();

    if had_error {
        return Err(CompileError);
    }
    Ok(function)
}

impl<'src, 'vm> Compiler<'src, 'vm> {
    // ---- token stream plumbing --------------------------------------

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.parser.scanner.scan_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let message = self.parser.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.parser.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.parser.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        self.parser.had_error = true;
        self.reporter.error(Report {
            phase: Phase::Compiling,
            message: message.to_string(),
            line: token.line,
            at_eof: token.kind == TokenKind::Eof,
            lexeme: token.lexeme.to_string(),
        });
    }

    // ---- bytecode emission -------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.current.function.as_function_mut().chunk.write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.parser.previous.line;
        self.current.function.as_function_mut().chunk.write_op(op, line);
    }

    fn emit_bytes(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.parser.previous.line;
        self.current.function.as_function_mut().chunk.emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if self.current.function.as_function_mut().chunk.patch_jump(offset).is_err() {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.parser.previous.line;
        if self.current.function.as_function_mut().chunk.emit_loop(loop_start, line).is_err() {
            self.error("Loop body too large.");
        }
    }

    fn emit_return(&mut self) {
        if self.current.function_type == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    /// Pushes `value` onto the VM stack before writing it into the
    /// chunk's constant pool, mirroring the original `addConstant`'s
    /// push/pop around the array write — a second line of defense to
    /// `self.current.function` already being a rooted heap object.
    fn make_constant(&mut self, value: Value) -> u8 {
        self.vm.push(value);
        let index = self.current.function.as_function_mut().chunk.add_constant(value);
        self.vm.pop();
        match index {
            Some(index) => index,
            None => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_bytes(OpCode::Constant, index);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let obj = self.vm.intern_string(name.as_bytes());
        self.make_constant(Value::Obj(obj))
    }

    // ---- scopes --------------------------------------------------------

    fn begin_scope(&mut self) {
        self.current.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current.scope_depth -= 1;
        while let Some(local) = self.current.locals.last() {
            if local.depth <= self.current.scope_depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current.locals.pop();
        }
    }

    // ---- variable declaration/resolution -------------------------------

    fn declare_variable(&mut self) {
        if self.current.scope_depth == 0 {
            return;
        }
        let name = self.parser.previous.lexeme;
        let mut redeclared = false;
        for local in self.current.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.current.scope_depth {
                break;
            }
            if local.name == name {
                redeclared = true;
            }
        }
        if redeclared {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current.locals.len() >= MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.current.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        if self.current.scope_depth == 0 {
            return;
        }
        let depth = self.current.scope_depth;
        if let Some(local) = self.current.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn parse_variable(&mut self, error_message: &str) -> u8 {
        self.consume(TokenKind::Identifier, error_message);
        self.declare_variable();
        if self.current.scope_depth > 0 {
            return 0;
        }
        let name = self.parser.previous.lexeme;
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global: u8) {
        if self.current.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal, global);
    }

    /// `Ok(slot)` on a resolved, initialized local; `Err(())` if the name
    /// matches a local still mid-initialization (read-in-own-initializer).
    fn resolve_local(state: &CompilerState<'src>, name: &str) -> Option<Result<u8, ()>> {
        for (index, local) in state.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Some(Err(()));
                }
                return Some(Ok(index as u8));
            }
        }
        None
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> u8 {
        for (i, up) in self.current.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if self.current.upvalues.len() >= MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.current.upvalues.push(UpvalueDecl { index, is_local });
        self.current.function.as_function_mut().upvalue_count = self.current.upvalues.len() as u8;
        (self.current.upvalues.len() - 1) as u8
    }

    /// Resolves `name` as an upvalue of the *current* compiler by looking
    /// in the enclosing compiler first as a local, then (recursively) as
    /// an upvalue of its own enclosing compiler. Implemented by
    /// temporarily swapping `self.current` one level up the chain so each
    /// recursive step only ever touches `self.current`/`self.current.enclosing`.
    fn resolve_upvalue(&mut self, name: &str) -> Option<u8> {
        let mut enclosing = self.current.enclosing.take()?;

        let local = Self::resolve_local(&enclosing, name);
        let result = match local {
            Some(Ok(index)) => {
                enclosing.locals[index as usize].is_captured = true;
                self.current.enclosing = Some(enclosing);
                Some(self.add_upvalue(index, true))
            }
            Some(Err(())) => {
                self.error("Can't read local variable in its own initializer.");
                self.current.enclosing = Some(enclosing);
                None
            }
            None => {
                let child = std::mem::replace(&mut self.current, *enclosing);
                let parent_upvalue = self.resolve_upvalue(name);
                let parent = std::mem::replace(&mut self.current, child);
                self.current.enclosing = Some(Box::new(parent));
                parent_upvalue.map(|index| self.add_upvalue(index, false))
            }
        };
        result
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let resolved_local = Self::resolve_local(&self.current, name);
        let (get_op, set_op, arg) = match resolved_local {
            Some(Ok(index)) => (OpCode::GetLocal, OpCode::SetLocal, index),
            Some(Err(())) => {
                self.error("Can't read local variable in its own initializer.");
                (OpCode::GetLocal, OpCode::SetLocal, 0)
            }
            None => {
                if let Some(index) = self.resolve_upvalue(name) {
                    (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
                } else {
                    let constant = self.identifier_constant(name);
                    (OpCode::GetGlobal, OpCode::SetGlobal, constant)
                }
            }
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op, arg);
        } else {
            self.emit_bytes(get_op, arg);
        }
    }

    // ---- Pratt core ------------------------------------------------------

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = Self::get_rule(self.parser.previous.kind).0;
        let prefix = match prefix {
            Some(f) => f,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::get_rule(self.parser.current.kind).2 {
            self.advance();
            let infix = Self::get_rule(self.parser.previous.kind).1.unwrap();
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    #[allow(clippy::type_complexity)]
    fn get_rule(kind: TokenKind) -> (Option<PrefixFn<'src, 'vm>>, Option<InfixFn<'src, 'vm>>, Precedence) {
        use TokenKind::*;
        match kind {
            LeftParen => (Some(Self::grouping), Some(Self::call), Precedence::Call),
            Dot => (None, Some(Self::dot), Precedence::Call),
            Minus => (Some(Self::unary), Some(Self::binary), Precedence::Term),
            Plus => (None, Some(Self::binary), Precedence::Term),
            Slash | Star => (None, Some(Self::binary), Precedence::Factor),
            Bang => (Some(Self::unary), None, Precedence::None),
            BangEqual | EqualEqual => (None, Some(Self::binary), Precedence::Equality),
            Greater | GreaterEqual | Less | LessEqual => (None, Some(Self::binary), Precedence::Comparison),
            Identifier => (Some(Self::variable), None, Precedence::None),
            String => (Some(Self::string), None, Precedence::None),
            Number => (Some(Self::number), None, Precedence::None),
            TokenKind::And => (None, Some(Self::and), Precedence::And),
            TokenKind::Or => (None, Some(Self::or), Precedence::Or),
            False | Nil | True => (Some(Self::literal), None, Precedence::None),
            Super => (Some(Self::super_), None, Precedence::None),
            This => (Some(Self::this), None, Precedence::None),
            _ => (None, None, Precedence::None),
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.parser.previous.lexeme.parse().unwrap_or(f64::NAN);
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.parser.previous.lexeme;
        let bytes = &lexeme.as_bytes()[1..lexeme.len() - 1];
        let obj = self.vm.intern_string(bytes);
        self.emit_constant(Value::Obj(obj));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.parser.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.parser.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        if self.current_class.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match &self.current_class {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.")
            }
            _ => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.parser.previous.lexeme;
        let name_constant = self.identifier_constant(name);
        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_bytes(OpCode::SuperInvoke, name_constant);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_bytes(OpCode::GetSuper, name_constant);
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.parser.previous.kind;
        let rule = Self::get_rule(operator);
        self.parse_precedence(rule.2.next());
        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
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

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_bytes(OpCode::Call, argc);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.parser.previous.lexeme;
        let name_constant = self.identifier_constant(name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty, name_constant);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_bytes(OpCode::Invoke, name_constant);
            self.emit_byte(argc);
        } else {
            self.emit_bytes(OpCode::GetProperty, name_constant);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc >= MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    argc += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    // ---- statements --------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.parser.current.kind {
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

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
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

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.current.function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current.function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
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
        let loop_start = self.current.function.as_function().chunk.len();
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

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer clause
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current.function.as_function().chunk.len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current.function.as_function().chunk.len();
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

    // ---- functions & classes ------------------------------------------

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        let name_lexeme = self.parser.previous.lexeme;
        let name = self.vm.intern_string(name_lexeme.as_bytes());

        let new_state = CompilerState::new(function_type, Some(name), self.vm);
        let enclosing = std::mem::replace(&mut self.current, new_state);
        self.current.enclosing = Some(Box::new(enclosing));
        self.vm.push_compiler_root(self.current.function);

        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current.function.as_function().arity as usize >= MAX_PARAMS {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.current.function.as_function_mut().arity += 1;
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

        let (function, upvalues) = self.end_compiler();
        // `function` stays rooted by the `push_compiler_root` call above
        // until it is embedded here as a constant of the now-restored
        // enclosing function's chunk, which is itself rooted the same
        // way — only then is it safe to drop this frame's root.
        let const_index = self.make_constant(Value::Obj(function));
        self.emit_bytes(OpCode::Closure, const_index);
        for up in upvalues {
            self.emit_byte(if up.is_local { 1 } else { 0 });
            self.emit_byte(up.index);
        }
        self.vm.pop_compiler_root();
    }

    /// Pops `self.current` back to its enclosing compiler (or, for the
    /// top-level script, leaves a fresh unused placeholder behind it —
    /// there is no further use of `self.current` once the caller returns)
    /// and hands back the completed function plus its upvalue list. The
    /// function object itself was already allocated at `CompilerState::new`
    /// and only needs its chunk disassembled now that it's complete.
    fn end_compiler(&mut self) -> (ObjRef, Vec<UpvalueDecl>) {
        self.emit_return();
        let enclosing = self.current.enclosing.take();
        let replacement = match enclosing {
            Some(parent) => *parent,
            None => CompilerState::new(FunctionType::Script, None, self.vm),
        };
        let finished = std::mem::replace(&mut self.current, replacement);
        self.vm.debug_disassemble(finished.function);
        (finished.function, finished.upvalues)
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.parser.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit_bytes(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.current_class = Some(Box::new(ClassCompilerState {
            enclosing: self.current_class.take(),
            has_superclass: false,
        }));

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let superclass_name = self.parser.previous.lexeme;
            self.variable(false);
            if superclass_name == class_name {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            if let Some(class) = &mut self.current_class {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let had_superclass = self
            .current_class
            .as_ref()
            .map(|c| c.has_superclass)
            .unwrap_or(false);
        if had_superclass {
            self.end_scope();
        }

        self.current_class = self.current_class.take().and_then(|c| c.enclosing);
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.parser.previous.lexeme;
        let name_constant = self.identifier_constant(name);
        let function_type = if name == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(function_type);
        self.emit_bytes(OpCode::Method, name_constant);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::CollectingReporter;
    use crate::vm::Vm;
    use rstest::rstest;

    fn compile_errors(source: &str) -> Vec<String> {
        let mut vm = Vm::new();
        let mut reporter = CollectingReporter::default();
        match compile(source, &mut vm, &mut reporter) {
            Ok(_) => Vec::new(),
            Err(_) => reporter.reports.into_iter().map(|r| r.message).collect(),
        }
    }

    #[rstest]
    #[case("print 1 + 2 * 3 - 4 / 2;")]
    #[case("fun f(a, b) { return a + b; } print f(1, 2);")]
    #[case("class A {} class B < A {}")]
    fn well_formed_programs_compile_cleanly(#[case] source: &str) {
        assert!(compile_errors(source).is_empty());
    }

    #[test]
    fn redeclaring_a_local_in_the_same_scope_is_an_error() {
        let errors = compile_errors("{ var x = 1; var x = 2; }");
        assert!(errors.iter().any(|m| m.contains("Already a variable")));
    }

    #[test]
    fn reading_a_local_in_its_own_initializer_is_an_error() {
        let errors = compile_errors("{ var x = x; }");
        assert!(errors.iter().any(|m| m.contains("own initializer")));
    }

    #[test]
    fn returning_from_top_level_is_an_error() {
        let errors = compile_errors("return 1;");
        assert!(errors.iter().any(|m| m.contains("return from top-level")));
    }

    #[test]
    fn returning_a_value_from_an_initializer_is_an_error() {
        let errors = compile_errors("class A { init() { return 1; } }");
        assert!(errors.iter().any(|m| m.contains("return a value from an initializer")));
    }

    #[test]
    fn this_outside_a_class_is_an_error() {
        let errors = compile_errors("print this;");
        assert!(errors.iter().any(|m| m.contains("'this' outside")));
    }

    #[test]
    fn super_outside_a_class_is_an_error() {
        let errors = compile_errors("fun f() { super.g(); }");
        assert!(errors.iter().any(|m| m.contains("'super' outside")));
    }

    #[test]
    fn super_in_a_class_with_no_superclass_is_an_error() {
        let errors = compile_errors("class A { m() { super.m(); } }");
        assert!(errors.iter().any(|m| m.contains("no superclass")));
    }

    #[test]
    fn self_inheritance_is_an_error() {
        let errors = compile_errors("class A < A {}");
        assert!(errors.iter().any(|m| m.contains("inherit from itself")));
    }

    #[test]
    fn invalid_assignment_target_is_an_error() {
        let errors = compile_errors("1 + 2 = 3;");
        assert!(errors.iter().any(|m| m.contains("Invalid assignment target")));
    }

    /// §5/§8 boundary: the 256th local in one scope overflows the fixed
    /// `MAX_LOCALS` table.
    #[test]
    fn the_257th_local_overflows() {
        let mut source = String::from("{\n");
        for i in 0..257 {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        source.push('}');
        let errors = compile_errors(&source);
        assert!(errors.iter().any(|m| m.contains("Too many local variables")));
    }

    /// §8 boundary: a 257th distinct constant in one chunk overflows the
    /// one-byte constant index.
    #[test]
    fn the_257th_constant_overflows() {
        let mut source = String::new();
        for i in 0..257 {
            source.push_str(&format!("print {i}.5;\n"));
        }
        let errors = compile_errors(&source);
        assert!(errors.iter().any(|m| m.contains("Too many constants")));
    }

    #[test]
    fn more_than_255_arguments_is_an_error() {
        let mut source = String::from("fun f() {} f(");
        for i in 0..256 {
            if i > 0 {
                source.push(',');
            }
            source.push_str("1");
        }
        source.push_str(");");
        let errors = compile_errors(&source);
        assert!(errors.iter().any(|m| m.contains("more than 255 arguments")));
    }
}
