use std::fmt;

use bitflags::bitflags;

use crate::compiler::diagnostics::SrcLoc;
use crate::compiler::intern::Atom;
use crate::compiler::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Eof,
    Invalid,

    IntLit,
    FloatLit,
    CharLit,
    StrLit,
    Ident,

    // Keywords
    KwAuto,
    KwBreak,
    KwCase,
    KwChar,
    KwConst,
    KwContinue,
    KwDefault,
    KwDo,
    KwDouble,
    KwElse,
    KwEnum,
    KwExtern,
    KwFloat,
    KwFor,
    KwGoto,
    KwIf,
    KwInline,
    KwInt,
    KwLong,
    KwRegister,
    KwRestrict,
    KwReturn,
    KwShort,
    KwSigned,
    KwSizeof,
    KwStatic,
    KwStruct,
    KwSwitch,
    KwTypedef,
    KwUnion,
    KwUnsigned,
    KwVoid,
    KwVolatile,
    KwWhile,
    KwBool,
    KwComplex,
    KwImaginary,

    // Punctuators
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Dot,
    Arrow,
    PlusPlus,
    MinusMinus,
    Amp,
    Star,
    Plus,
    Minus,
    Tilde,
    Bang,
    Slash,
    Percent,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    EqEq,
    Ne,
    Caret,
    Pipe,
    AmpAmp,
    PipePipe,
    Question,
    Colon,
    Semicolon,
    Ellipsis,
    Assign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    PlusAssign,
    MinusAssign,
    ShlAssign,
    ShrAssign,
    AmpAssign,
    CaretAssign,
    PipeAssign,
    Comma,
    Hash,
    HashHash,
}

impl TokenKind {
    /// True for any keyword that can begin a declaration.
    pub fn is_type_keyword(self) -> bool {
        matches!(
            self,
            TokenKind::KwVoid
                | TokenKind::KwChar
                | TokenKind::KwShort
                | TokenKind::KwInt
                | TokenKind::KwLong
                | TokenKind::KwFloat
                | TokenKind::KwDouble
                | TokenKind::KwSigned
                | TokenKind::KwUnsigned
                | TokenKind::KwBool
                | TokenKind::KwComplex
                | TokenKind::KwImaginary
                | TokenKind::KwStruct
                | TokenKind::KwUnion
                | TokenKind::KwEnum
                | TokenKind::KwConst
                | TokenKind::KwVolatile
                | TokenKind::KwRestrict
                | TokenKind::KwInline
                | TokenKind::KwStatic
                | TokenKind::KwExtern
                | TokenKind::KwRegister
                | TokenKind::KwAuto
                | TokenKind::KwTypedef
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Eof => "EOF",
            TokenKind::Invalid => "<invalid>",
            TokenKind::IntLit => "integer literal",
            TokenKind::FloatLit => "float literal",
            TokenKind::CharLit => "char literal",
            TokenKind::StrLit => "string literal",
            TokenKind::Ident => "identifier",
            TokenKind::KwAuto => "auto",
            TokenKind::KwBreak => "break",
            TokenKind::KwCase => "case",
            TokenKind::KwChar => "char",
            TokenKind::KwConst => "const",
            TokenKind::KwContinue => "continue",
            TokenKind::KwDefault => "default",
            TokenKind::KwDo => "do",
            TokenKind::KwDouble => "double",
            TokenKind::KwElse => "else",
            TokenKind::KwEnum => "enum",
            TokenKind::KwExtern => "extern",
            TokenKind::KwFloat => "float",
            TokenKind::KwFor => "for",
            TokenKind::KwGoto => "goto",
            TokenKind::KwIf => "if",
            TokenKind::KwInline => "inline",
            TokenKind::KwInt => "int",
            TokenKind::KwLong => "long",
            TokenKind::KwRegister => "register",
            TokenKind::KwRestrict => "restrict",
            TokenKind::KwReturn => "return",
            TokenKind::KwShort => "short",
            TokenKind::KwSigned => "signed",
            TokenKind::KwSizeof => "sizeof",
            TokenKind::KwStatic => "static",
            TokenKind::KwStruct => "struct",
            TokenKind::KwSwitch => "switch",
            TokenKind::KwTypedef => "typedef",
            TokenKind::KwUnion => "union",
            TokenKind::KwUnsigned => "unsigned",
            TokenKind::KwVoid => "void",
            TokenKind::KwVolatile => "volatile",
            TokenKind::KwWhile => "while",
            TokenKind::KwBool => "_Bool",
            TokenKind::KwComplex => "_Complex",
            TokenKind::KwImaginary => "_Imaginary",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Dot => ".",
            TokenKind::Arrow => "->",
            TokenKind::PlusPlus => "++",
            TokenKind::MinusMinus => "--",
            TokenKind::Amp => "&",
            TokenKind::Star => "*",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Tilde => "~",
            TokenKind::Bang => "!",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Shl => "<<",
            TokenKind::Shr => ">>",
            TokenKind::Lt => "<",
            TokenKind::Gt => ">",
            TokenKind::Le => "<=",
            TokenKind::Ge => ">=",
            TokenKind::EqEq => "==",
            TokenKind::Ne => "!=",
            TokenKind::Caret => "^",
            TokenKind::Pipe => "|",
            TokenKind::AmpAmp => "&&",
            TokenKind::PipePipe => "||",
            TokenKind::Question => "?",
            TokenKind::Colon => ":",
            TokenKind::Semicolon => ";",
            TokenKind::Ellipsis => "...",
            TokenKind::Assign => "=",
            TokenKind::StarAssign => "*=",
            TokenKind::SlashAssign => "/=",
            TokenKind::PercentAssign => "%=",
            TokenKind::PlusAssign => "+=",
            TokenKind::MinusAssign => "-=",
            TokenKind::ShlAssign => "<<=",
            TokenKind::ShrAssign => ">>=",
            TokenKind::AmpAssign => "&=",
            TokenKind::CaretAssign => "^=",
            TokenKind::PipeAssign => "|=",
            TokenKind::Comma => ",",
            TokenKind::Hash => "#",
            TokenKind::HashHash => "##",
        };
        f.write_str(s)
    }
}

bitflags! {
    /// Flags attached to tokens: literal suffixes, the wide-literal marker,
    /// and the two positional flags the preprocessor relies on.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct TokenFlags: u8 {
        const UNSIGNED = 1 << 0;
        const LONG = 1 << 1;
        const LONG_LONG = 1 << 2;
        const WIDE = 1 << 3;
        const AT_BOL = 1 << 4;
        const HAS_SPACE = 1 << 5;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Token {
    pub kind: TokenKind,
    pub loc: SrcLoc,
    /// Interned lexeme: identifier/number spelling, or the decoded bytes of
    /// a string literal.
    pub text: Option<Atom>,
    pub ival: u64,
    pub fval: f64,
    pub flags: TokenFlags,
}

impl Token {
    fn blank(loc: SrcLoc) -> Self {
        Token {
            kind: TokenKind::Eof,
            loc,
            text: None,
            ival: 0,
            fval: 0.0,
            flags: TokenFlags::empty(),
        }
    }
}

fn keyword(text: &[u8]) -> Option<TokenKind> {
    Some(match text {
        b"auto" => TokenKind::KwAuto,
        b"break" => TokenKind::KwBreak,
        b"case" => TokenKind::KwCase,
        b"char" => TokenKind::KwChar,
        b"const" => TokenKind::KwConst,
        b"continue" => TokenKind::KwContinue,
        b"default" => TokenKind::KwDefault,
        b"do" => TokenKind::KwDo,
        b"double" => TokenKind::KwDouble,
        b"else" => TokenKind::KwElse,
        b"enum" => TokenKind::KwEnum,
        b"extern" => TokenKind::KwExtern,
        b"float" => TokenKind::KwFloat,
        b"for" => TokenKind::KwFor,
        b"goto" => TokenKind::KwGoto,
        b"if" => TokenKind::KwIf,
        b"inline" => TokenKind::KwInline,
        b"int" => TokenKind::KwInt,
        b"long" => TokenKind::KwLong,
        b"register" => TokenKind::KwRegister,
        b"restrict" => TokenKind::KwRestrict,
        b"return" => TokenKind::KwReturn,
        b"short" => TokenKind::KwShort,
        b"signed" => TokenKind::KwSigned,
        b"sizeof" => TokenKind::KwSizeof,
        b"static" => TokenKind::KwStatic,
        b"struct" => TokenKind::KwStruct,
        b"switch" => TokenKind::KwSwitch,
        b"typedef" => TokenKind::KwTypedef,
        b"union" => TokenKind::KwUnion,
        b"unsigned" => TokenKind::KwUnsigned,
        b"void" => TokenKind::KwVoid,
        b"volatile" => TokenKind::KwVolatile,
        b"while" => TokenKind::KwWhile,
        b"_Bool" => TokenKind::KwBool,
        b"_Complex" => TokenKind::KwComplex,
        b"_Imaginary" => TokenKind::KwImaginary,
        _ => return None,
    })
}

/// Byte-oriented scanner over preprocessed text. Keeps the current token and
/// a single token of lookahead; `# N "file"` markers embedded by the
/// preprocessor are consumed during whitespace skipping and update the
/// scanner's apparent position.
pub struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
    file: Atom,
    line: u32,
    col: u32,
    at_bol: bool,
    pub cur: Token,
    peeked: Option<Token>,
}

impl<'a> Scanner<'a> {
    pub fn new(src: &'a str, file: Atom) -> Self {
        let loc = SrcLoc::new(file, 1, 1);
        Scanner {
            src: src.as_bytes(),
            pos: 0,
            file,
            line: 1,
            col: 1,
            at_bol: true,
            cur: Token::blank(loc),
            peeked: None,
        }
    }

    fn byte(&self, offset: usize) -> u8 {
        *self.src.get(self.pos + offset).unwrap_or(&0)
    }

    fn advance(&mut self) -> u8 {
        let c = self.byte(0);
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        if self.pos < self.src.len() {
            self.pos += 1;
        }
        c
    }

    fn eat_byte(&mut self, c: u8) -> bool {
        if self.byte(0) == c {
            self.advance();
            return true;
        }
        false
    }

    fn loc(&self) -> SrcLoc {
        SrcLoc::new(self.file, self.line, self.col)
    }

    /// Skip whitespace, comments, line splices, and preprocessor line
    /// markers. Returns (at_bol, has_space) for the upcoming token.
    fn skip_whitespace(&mut self, sess: &mut Session) -> (bool, bool) {
        let mut at_bol = self.at_bol;
        let mut has_space = false;
        loop {
            // Line splicing: backslash-newline.
            if self.byte(0) == b'\\' && self.byte(1) == b'\n' {
                self.advance();
                self.advance();
                has_space = true;
                continue;
            }
            if self.byte(0) == b'\\' && self.byte(1) == b'\r' && self.byte(2) == b'\n' {
                self.advance();
                self.advance();
                self.advance();
                has_space = true;
                continue;
            }
            match self.byte(0) {
                b' ' | b'\t' | b'\x0c' | b'\x0b' => {
                    self.advance();
                    has_space = true;
                    continue;
                }
                b'\r' => {
                    self.advance();
                    if self.byte(0) == b'\n' {
                        self.advance();
                    }
                    at_bol = true;
                    self.at_bol = true;
                    has_space = true;
                    continue;
                }
                b'\n' => {
                    self.advance();
                    at_bol = true;
                    self.at_bol = true;
                    has_space = true;
                    continue;
                }
                _ => {}
            }
            // Line marker: # linenum "filename"
            if self.byte(0) == b'#' && at_bol {
                let save = (self.pos, self.line, self.col);
                self.advance();
                while self.byte(0) == b' ' || self.byte(0) == b'\t' {
                    self.advance();
                }
                if self.byte(0).is_ascii_digit() {
                    let mut newline: u32 = 0;
                    while self.byte(0).is_ascii_digit() {
                        newline = newline
                            .wrapping_mul(10)
                            .wrapping_add((self.advance() - b'0') as u32);
                    }
                    while self.byte(0) == b' ' || self.byte(0) == b'\t' {
                        self.advance();
                    }
                    if self.byte(0) == b'"' {
                        self.advance();
                        let start = self.pos;
                        while self.byte(0) != 0 && self.byte(0) != b'"' {
                            self.advance();
                        }
                        if self.pos > start {
                            let name = self.src[start..self.pos].to_vec();
                            self.file = sess.interner.intern_bytes(&name);
                        }
                        if self.byte(0) == b'"' {
                            self.advance();
                        }
                    }
                    while self.byte(0) != 0 && self.byte(0) != b'\n' {
                        self.advance();
                    }
                    if self.byte(0) == b'\n' {
                        self.advance();
                    }
                    self.line = newline;
                    self.col = 1;
                    has_space = true;
                    at_bol = true;
                    self.at_bol = true;
                    continue;
                }
                // Not a line marker; restore.
                self.pos = save.0;
                self.line = save.1;
                self.col = save.2;
            }
            // Block comment.
            if self.byte(0) == b'/' && self.byte(1) == b'*' {
                self.advance();
                self.advance();
                while self.byte(0) != 0 {
                    if self.byte(0) == b'*' && self.byte(1) == b'/' {
                        self.advance();
                        self.advance();
                        break;
                    }
                    self.advance();
                }
                has_space = true;
                continue;
            }
            // Line comment.
            if self.byte(0) == b'/' && self.byte(1) == b'/' {
                self.advance();
                self.advance();
                while self.byte(0) != 0 && self.byte(0) != b'\n' {
                    self.advance();
                }
                has_space = true;
                continue;
            }
            break;
        }
        (at_bol, has_space)
    }

    fn lex_number(&mut self, sess: &mut Session, tok: &mut Token) {
        let start = self.pos;
        let mut is_float = false;
        let mut base = 10u32;

        if self.byte(0) == b'0' {
            match self.byte(1) {
                b'x' | b'X' => {
                    base = 16;
                    self.advance();
                    self.advance();
                    while self.byte(0).is_ascii_hexdigit() {
                        self.advance();
                    }
                }
                b'.' | b'e' | b'E' => {
                    self.advance();
                }
                b'0'..=b'9' => {
                    base = 8;
                    self.advance();
                    while (b'0'..=b'7').contains(&self.byte(0)) {
                        self.advance();
                    }
                }
                _ => {
                    self.advance();
                }
            }
        }

        if base == 10 {
            while self.byte(0).is_ascii_digit() {
                self.advance();
            }
        }

        if self.byte(0) == b'.' && base != 8 {
            is_float = true;
            self.advance();
            if base == 16 {
                while self.byte(0).is_ascii_hexdigit() {
                    self.advance();
                }
            } else {
                while self.byte(0).is_ascii_digit() {
                    self.advance();
                }
            }
        }

        if base == 16 && (self.byte(0) == b'p' || self.byte(0) == b'P') {
            is_float = true;
            self.advance();
            if self.byte(0) == b'+' || self.byte(0) == b'-' {
                self.advance();
            }
            while self.byte(0).is_ascii_digit() {
                self.advance();
            }
        } else if base != 16 && (self.byte(0) == b'e' || self.byte(0) == b'E') {
            is_float = true;
            self.advance();
            if self.byte(0) == b'+' || self.byte(0) == b'-' {
                self.advance();
            }
            while self.byte(0).is_ascii_digit() {
                self.advance();
            }
        }

        let digits_end = self.pos;

        if is_float {
            if self.byte(0) == b'f' || self.byte(0) == b'F' {
                self.advance();
            } else if self.byte(0) == b'l' || self.byte(0) == b'L' {
                self.advance();
                tok.flags |= TokenFlags::LONG;
            }
            tok.kind = TokenKind::FloatLit;
            tok.fval = parse_float_text(&self.src[start..digits_end]);
        } else {
            loop {
                let c = self.byte(0);
                if (c == b'u' || c == b'U') && !tok.flags.contains(TokenFlags::UNSIGNED) {
                    tok.flags |= TokenFlags::UNSIGNED;
                    self.advance();
                } else if (c == b'l' || c == b'L') && !tok.flags.contains(TokenFlags::LONG_LONG) {
                    if tok.flags.contains(TokenFlags::LONG) {
                        tok.flags.remove(TokenFlags::LONG);
                        tok.flags |= TokenFlags::LONG_LONG;
                    } else {
                        tok.flags |= TokenFlags::LONG;
                    }
                    self.advance();
                } else {
                    break;
                }
            }
            tok.kind = TokenKind::IntLit;
            tok.ival = parse_int_text(&self.src[start..digits_end]);
        }
        tok.text = Some(sess.interner.intern_bytes(&self.src[start..self.pos]));
    }

    fn lex_escape(&mut self) -> i32 {
        self.advance(); // backslash
        let c = self.advance();
        match c {
            b'a' => 0x07,
            b'b' => 0x08,
            b'f' => 0x0c,
            b'n' => b'\n' as i32,
            b'r' => b'\r' as i32,
            b't' => b'\t' as i32,
            b'v' => 0x0b,
            b'\\' => b'\\' as i32,
            b'\'' => b'\'' as i32,
            b'"' => b'"' as i32,
            b'?' => b'?' as i32,
            b'0'..=b'7' => {
                let mut val = (c - b'0') as i32;
                if (b'0'..=b'7').contains(&self.byte(0)) {
                    val = val * 8 + (self.advance() - b'0') as i32;
                    if (b'0'..=b'7').contains(&self.byte(0)) {
                        val = val * 8 + (self.advance() - b'0') as i32;
                    }
                }
                val
            }
            b'x' => {
                let mut val = 0i32;
                while self.byte(0).is_ascii_hexdigit() {
                    let d = self.advance();
                    let digit = match d {
                        b'0'..=b'9' => (d - b'0') as i32,
                        b'a'..=b'f' => (d - b'a') as i32 + 10,
                        _ => (d - b'A') as i32 + 10,
                    };
                    val = val.wrapping_mul(16).wrapping_add(digit);
                }
                val
            }
            _ => c as i32,
        }
    }

    fn lex_char_lit(&mut self, tok: &mut Token) {
        if self.byte(0) == b'L' {
            tok.flags |= TokenFlags::WIDE;
            self.advance();
        }
        self.advance(); // opening quote
        let c = if self.byte(0) == b'\\' {
            self.lex_escape()
        } else {
            self.advance() as i32
        };
        if self.byte(0) == b'\'' {
            self.advance();
        }
        tok.kind = TokenKind::CharLit;
        tok.ival = c as u64;
    }

    fn lex_string_lit(&mut self, sess: &mut Session, tok: &mut Token) {
        let mut bytes = Vec::new();
        if self.byte(0) == b'L' {
            tok.flags |= TokenFlags::WIDE;
            self.advance();
        }
        self.advance(); // opening quote
        while self.byte(0) != 0 && self.byte(0) != b'"' {
            if self.byte(0) == b'\\' {
                let c = self.lex_escape();
                bytes.push(c as u8);
            } else {
                bytes.push(self.advance());
            }
        }
        if self.byte(0) == b'"' {
            self.advance();
        }
        tok.kind = TokenKind::StrLit;
        tok.text = Some(sess.interner.intern_bytes(&bytes));
    }

    fn lex_token(&mut self, sess: &mut Session) -> Token {
        let (at_bol, has_space) = self.skip_whitespace(sess);
        self.at_bol = false;
        let mut tok = Token::blank(self.loc());
        if at_bol {
            tok.flags |= TokenFlags::AT_BOL;
        }
        if has_space {
            tok.flags |= TokenFlags::HAS_SPACE;
        }

        let c = self.byte(0);
        if c == 0 {
            tok.kind = TokenKind::Eof;
            return tok;
        }

        // Wide char/string literal.
        if c == b'L' && (self.byte(1) == b'\'' || self.byte(1) == b'"') {
            if self.byte(1) == b'\'' {
                self.lex_char_lit(&mut tok);
            } else {
                self.lex_string_lit(sess, &mut tok);
            }
            return tok;
        }

        // Identifier or keyword.
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = self.pos;
            while self.byte(0).is_ascii_alphanumeric() || self.byte(0) == b'_' {
                self.advance();
            }
            let text = &self.src[start..self.pos];
            tok.kind = keyword(text).unwrap_or(TokenKind::Ident);
            tok.text = Some(sess.interner.intern_bytes(text));
            return tok;
        }

        // Number.
        if c.is_ascii_digit() || (c == b'.' && self.byte(1).is_ascii_digit()) {
            self.lex_number(sess, &mut tok);
            return tok;
        }

        if c == b'\'' {
            self.lex_char_lit(&mut tok);
            return tok;
        }
        if c == b'"' {
            self.lex_string_lit(sess, &mut tok);
            return tok;
        }

        self.advance();
        tok.kind = match c {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b'~' => TokenKind::Tilde,
            b'?' => TokenKind::Question,
            b';' => TokenKind::Semicolon,
            b',' => TokenKind::Comma,
            b':' => TokenKind::Colon,
            b'.' => {
                if self.byte(0) == b'.' && self.byte(1) == b'.' {
                    self.advance();
                    self.advance();
                    TokenKind::Ellipsis
                } else {
                    TokenKind::Dot
                }
            }
            b'#' => {
                if self.eat_byte(b'#') {
                    TokenKind::HashHash
                } else {
                    TokenKind::Hash
                }
            }
            b'+' => {
                if self.eat_byte(b'+') {
                    TokenKind::PlusPlus
                } else if self.eat_byte(b'=') {
                    TokenKind::PlusAssign
                } else {
                    TokenKind::Plus
                }
            }
            b'-' => {
                if self.eat_byte(b'-') {
                    TokenKind::MinusMinus
                } else if self.eat_byte(b'>') {
                    TokenKind::Arrow
                } else if self.eat_byte(b'=') {
                    TokenKind::MinusAssign
                } else {
                    TokenKind::Minus
                }
            }
            b'*' => {
                if self.eat_byte(b'=') {
                    TokenKind::StarAssign
                } else {
                    TokenKind::Star
                }
            }
            b'/' => {
                if self.eat_byte(b'=') {
                    TokenKind::SlashAssign
                } else {
                    TokenKind::Slash
                }
            }
            b'%' => {
                if self.eat_byte(b'=') {
                    TokenKind::PercentAssign
                } else {
                    TokenKind::Percent
                }
            }
            b'&' => {
                if self.eat_byte(b'&') {
                    TokenKind::AmpAmp
                } else if self.eat_byte(b'=') {
                    TokenKind::AmpAssign
                } else {
                    TokenKind::Amp
                }
            }
            b'|' => {
                if self.eat_byte(b'|') {
                    TokenKind::PipePipe
                } else if self.eat_byte(b'=') {
                    TokenKind::PipeAssign
                } else {
                    TokenKind::Pipe
                }
            }
            b'^' => {
                if self.eat_byte(b'=') {
                    TokenKind::CaretAssign
                } else {
                    TokenKind::Caret
                }
            }
            b'=' => {
                if self.eat_byte(b'=') {
                    TokenKind::EqEq
                } else {
                    TokenKind::Assign
                }
            }
            b'!' => {
                if self.eat_byte(b'=') {
                    TokenKind::Ne
                } else {
                    TokenKind::Bang
                }
            }
            b'<' => {
                if self.eat_byte(b'<') {
                    if self.eat_byte(b'=') {
                        TokenKind::ShlAssign
                    } else {
                        TokenKind::Shl
                    }
                } else if self.eat_byte(b'=') {
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            b'>' => {
                if self.eat_byte(b'>') {
                    if self.eat_byte(b'=') {
                        TokenKind::ShrAssign
                    } else {
                        TokenKind::Shr
                    }
                } else if self.eat_byte(b'=') {
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            _ => TokenKind::Invalid,
        };
        tok
    }

    /// Advance to the next token.
    pub fn next(&mut self, sess: &mut Session) {
        self.cur = match self.peeked.take() {
            Some(tok) => tok,
            None => self.lex_token(sess),
        };
    }

    /// One token of lookahead, without consuming.
    pub fn peek(&mut self, sess: &mut Session) -> Token {
        if self.peeked.is_none() {
            self.peeked = Some(self.lex_token(sess));
        }
        self.peeked.unwrap_or(self.cur)
    }

    /// Consume the current token if it has the given kind.
    pub fn eat(&mut self, sess: &mut Session, kind: TokenKind) -> bool {
        if self.cur.kind == kind {
            self.next(sess);
            return true;
        }
        false
    }
}

/// strtoull-style integer parsing: `0x` hex, leading `0` octal, else decimal.
fn parse_int_text(text: &[u8]) -> u64 {
    let s = std::str::from_utf8(text).unwrap_or("0");
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).unwrap_or(u64::MAX)
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).unwrap_or(u64::MAX)
    } else {
        s.parse().unwrap_or(u64::MAX)
    }
}

/// strtod-style float parsing, including hexadecimal floats (`0x1.8p3`).
fn parse_float_text(text: &[u8]) -> f64 {
    let s = std::str::from_utf8(text).unwrap_or("0");
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        return parse_hex_float(hex);
    }
    s.parse().unwrap_or(0.0)
}

fn parse_hex_float(s: &str) -> f64 {
    let (mantissa, exp) = match s.split_once(['p', 'P']) {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (s, 0),
    };
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    let mut val = 0.0f64;
    for c in int_part.chars() {
        if let Some(d) = c.to_digit(16) {
            val = val * 16.0 + d as f64;
        }
    }
    let mut scale = 1.0 / 16.0;
    for c in frac_part.chars() {
        if let Some(d) = c.to_digit(16) {
            val += d as f64 * scale;
        }
        scale /= 16.0;
    }
    val * (exp as f64).exp2()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn scan_all(src: &str) -> (Vec<Token>, Session) {
        let mut sess = Session::new();
        let file = sess.intern("test.c");
        let mut scanner = Scanner::new(src, file);
        let mut tokens = Vec::new();
        loop {
            scanner.next(&mut sess);
            let tok = scanner.cur;
            if tok.kind == TokenKind::Eof {
                break;
            }
            tokens.push(tok);
        }
        (tokens, sess)
    }

    #[rstest]
    #[case("123", 123, TokenFlags::empty())]
    #[case("0x1F", 31, TokenFlags::empty())]
    #[case("0777", 511, TokenFlags::empty())]
    #[case("42u", 42, TokenFlags::UNSIGNED)]
    #[case("42l", 42, TokenFlags::LONG)]
    #[case("42ll", 42, TokenFlags::LONG_LONG)]
    #[case("42ull", 42, TokenFlags::UNSIGNED.union(TokenFlags::LONG_LONG))]
    #[case("42LLU", 42, TokenFlags::UNSIGNED.union(TokenFlags::LONG_LONG))]
    #[case("18446744073709551615ULL", u64::MAX, TokenFlags::UNSIGNED.union(TokenFlags::LONG_LONG))]
    fn integer_literals(#[case] src: &str, #[case] value: u64, #[case] flags: TokenFlags) {
        let (tokens, _) = scan_all(src);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::IntLit);
        assert_eq!(tokens[0].ival, value);
        assert_eq!(tokens[0].flags & !TokenFlags::AT_BOL, flags);
    }

    #[rstest]
    #[case("1.5", 1.5)]
    #[case(".5", 0.5)]
    #[case("1e3", 1000.0)]
    #[case("2.5e-1", 0.25)]
    #[case("0x1.8p3", 12.0)]
    fn float_literals(#[case] src: &str, #[case] value: f64) {
        let (tokens, _) = scan_all(src);
        assert_eq!(tokens[0].kind, TokenKind::FloatLit);
        assert!((tokens[0].fval - value).abs() < 1e-12);
    }

    #[test]
    fn float_suffix_marks_long_double() {
        let (tokens, _) = scan_all("1.5l 1.5f");
        assert!(tokens[0].flags.contains(TokenFlags::LONG));
        assert!(!tokens[1].flags.contains(TokenFlags::LONG));
    }

    #[test]
    fn string_escapes_decode() {
        let (tokens, sess) = scan_all(r#""a\n\t\x41\101\\""#);
        assert_eq!(tokens[0].kind, TokenKind::StrLit);
        let atom = tokens[0].text.unwrap();
        assert_eq!(sess.interner.bytes(atom), b"a\n\tAA\\");
    }

    #[test]
    fn char_literals_and_wide_flag() {
        let (tokens, _) = scan_all(r"'a' '\n' L'w'");
        assert_eq!(tokens[0].ival, 97);
        assert_eq!(tokens[1].ival, 10);
        assert!(tokens[2].flags.contains(TokenFlags::WIDE));
    }

    #[test]
    fn keywords_and_punctuators() {
        let (tokens, _) = scan_all("while (x <<= 3) ... a->b ## #");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::KwWhile,
                TokenKind::LParen,
                TokenKind::Ident,
                TokenKind::ShlAssign,
                TokenKind::IntLit,
                TokenKind::RParen,
                TokenKind::Ellipsis,
                TokenKind::Ident,
                TokenKind::Arrow,
                TokenKind::Ident,
                TokenKind::HashHash,
                TokenKind::Hash,
            ]
        );
    }

    #[test]
    fn line_markers_resync_position() {
        let (tokens, sess) = scan_all("# 42 \"other.c\"\nx");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].loc.line, 42);
        assert_eq!(sess.interner.str(tokens[0].loc.file), "other.c");
    }

    #[test]
    fn bol_and_space_flags() {
        let (tokens, _) = scan_all("a b\nc");
        assert!(tokens[0].flags.contains(TokenFlags::AT_BOL));
        assert!(!tokens[1].flags.contains(TokenFlags::AT_BOL));
        assert!(tokens[1].flags.contains(TokenFlags::HAS_SPACE));
        assert!(tokens[2].flags.contains(TokenFlags::AT_BOL));
    }

    #[test]
    fn comments_are_whitespace() {
        let (tokens, _) = scan_all("a /* mid */ b // tail\nc");
        assert_eq!(tokens.len(), 3);
        assert!(tokens[1].flags.contains(TokenFlags::HAS_SPACE));
    }

    #[test]
    fn backslash_newline_splices() {
        let (tokens, sess) = scan_all("ab\\\ncd");
        assert_eq!(tokens.len(), 2); // splice is whitespace at token level
        assert_eq!(sess.interner.str(tokens[0].text.unwrap()), "ab");
    }
}
