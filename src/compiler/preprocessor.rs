use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use crate::compiler::cond_expr;
use crate::compiler::intern::Atom;
use crate::compiler::session::Session;

/// Maximum macro rescanning depth.
const MAX_EXPANSION_DEPTH: u32 = 32;

/// Standard headers the runtime supplies. Including one of these when no
/// real file is found substitutes an empty placeholder.
const RUNTIME_HEADERS: &[&str] = &[
    "stdio.h", "stdlib.h", "string.h", "math.h", "ctype.h", "assert.h", "stdarg.h", "stddef.h",
    "stdbool.h", "stdint.h", "limits.h", "float.h", "errno.h", "time.h", "signal.h", "setjmp.h",
];

#[derive(Debug, Clone)]
struct Macro {
    body: String,
    /// `None` for object-like macros.
    params: Option<Vec<String>>,
    is_variadic: bool,
}

/// Byte cursor over one file's text. `\r\n` collapses to `\n` on advance.
struct Cursor<'s> {
    src: &'s [u8],
    pos: usize,
    line: u32,
}

impl<'s> Cursor<'s> {
    fn new(src: &'s [u8]) -> Self {
        Cursor { src, pos: 0, line: 1 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn byte(&self, offset: usize) -> u8 {
        *self.src.get(self.pos + offset).unwrap_or(&0)
    }

    fn advance(&mut self) -> u8 {
        let mut c = self.byte(0);
        if c == b'\r' && self.byte(1) == b'\n' {
            self.pos += 1;
            c = b'\n';
        }
        if c == b'\n' {
            self.line += 1;
        }
        if self.pos < self.src.len() {
            self.pos += 1;
        }
        c
    }

    fn skip_line(&mut self) {
        while !self.at_end() && self.byte(0) != b'\n' && self.byte(0) != b'\r' {
            self.pos += 1;
        }
    }

    fn skip_ws_inline(&mut self) {
        while self.byte(0) == b' ' || self.byte(0) == b'\t' {
            self.pos += 1;
        }
    }

    fn read_ident(&mut self) -> Option<String> {
        let start = self.pos;
        while self.byte(0).is_ascii_alphanumeric() || self.byte(0) == b'_' {
            self.pos += 1;
        }
        if self.pos == start {
            return None;
        }
        Some(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    fn continuation_len(&self) -> usize {
        if self.byte(0) != b'\\' {
            return 0;
        }
        if self.byte(1) == b'\n' {
            return 2;
        }
        if self.byte(1) == b'\r' && self.byte(2) == b'\n' {
            return 3;
        }
        0
    }

    /// Read the rest of a logical directive line: backslash-newline joins
    /// collapse to a single space, block comments become one space, and a
    /// `//` comment ends the body.
    fn read_line(&mut self) -> String {
        self.skip_ws_inline();
        let mut body: Vec<u8> = Vec::new();
        while !self.at_end() && self.byte(0) != b'\n' && self.byte(0) != b'\r' {
            let cont = self.continuation_len();
            if cont > 0 {
                self.pos += cont;
                self.line += 1;
                self.skip_ws_inline();
                if !body.is_empty() {
                    body.push(b' ');
                }
                continue;
            }
            if self.byte(0) == b'/' && self.byte(1) == b'*' {
                self.pos += 2;
                while !self.at_end() && !(self.byte(0) == b'*' && self.byte(1) == b'/') {
                    if self.byte(0) == b'\n' || self.byte(0) == b'\r' {
                        self.line += 1;
                    }
                    self.pos += 1;
                }
                if !self.at_end() {
                    self.pos += 2;
                }
                if !body.is_empty() {
                    body.push(b' ');
                }
                continue;
            }
            if self.byte(0) == b'/' && self.byte(1) == b'/' {
                self.skip_line();
                break;
            }
            body.push(self.byte(0));
            self.pos += 1;
        }
        while matches!(body.last(), Some(b' ') | Some(b'\t')) {
            body.pop();
        }
        String::from_utf8_lossy(&body).into_owned()
    }
}

/// Line-oriented preprocessor. Consumes C source text and produces the
/// expanded text the scanner reads, with `# N "file"` markers at file
/// boundaries. The macro table lives here and lasts one compilation.
pub struct Preprocessor<'a> {
    sess: &'a mut Session,
    include_paths: Vec<PathBuf>,
    macros: HashMap<Atom, Macro>,
    out: Vec<u8>,
}

impl<'a> Preprocessor<'a> {
    pub fn new(sess: &'a mut Session, include_paths: Vec<PathBuf>) -> Self {
        let mut pp = Preprocessor {
            sess,
            include_paths,
            macros: HashMap::new(),
            out: Vec::new(),
        };
        pp.install_builtins();
        pp
    }

    /// Define an object-like macro (used for `-D` and the built-in set).
    pub fn define(&mut self, name: &str, value: &str) {
        let atom = self.sess.interner.intern(name);
        self.macros.insert(
            atom,
            Macro {
                body: value.to_string(),
                params: None,
                is_variadic: false,
            },
        );
    }

    fn undef(&mut self, name: &str) {
        let atom = self.sess.interner.intern(name);
        self.macros.remove(&atom);
    }

    fn find_macro(&mut self, name: &str) -> Option<Macro> {
        let atom = self.sess.interner.intern(name);
        self.macros.get(&atom).cloned()
    }

    fn macro_defined(&mut self, name: &str) -> bool {
        let atom = self.sess.interner.intern(name);
        self.macros.contains_key(&atom)
    }

    fn install_builtins(&mut self) {
        self.define("__STDC__", "1");
        self.define("__STDC_VERSION__", "199901L");
        self.define("__STDC_HOSTED__", "1");
        self.define("NULL", "((void*)0)");
        self.define("true", "1");
        self.define("false", "0");
        self.define("bool", "_Bool");
        self.define("EOF", "(-1)");

        // stdint aliases
        self.define("int8_t", "signed char");
        self.define("uint8_t", "unsigned char");
        self.define("int16_t", "short");
        self.define("uint16_t", "unsigned short");
        self.define("int32_t", "int");
        self.define("uint32_t", "unsigned int");
        self.define("int64_t", "long long");
        self.define("uint64_t", "unsigned long long");
        self.define("size_t", "unsigned int");
        self.define("ptrdiff_t", "int");
        self.define("intptr_t", "int");
        self.define("uintptr_t", "unsigned int");

        // limits
        self.define("INT_MIN", "(-2147483647-1)");
        self.define("INT_MAX", "2147483647");
        self.define("UINT_MAX", "4294967295u");
        self.define("LONG_MIN", "(-2147483647L-1)");
        self.define("LONG_MAX", "2147483647L");
        self.define("CHAR_BIT", "8");
        self.define("SCHAR_MIN", "(-128)");
        self.define("SCHAR_MAX", "127");
        self.define("UCHAR_MAX", "255");
        self.define("SHRT_MIN", "(-32768)");
        self.define("SHRT_MAX", "32767");
        self.define("USHRT_MAX", "65535");

        // errno
        self.define("errno", "(*__errno_ptr())");
        self.define("EINVAL", "22");
        self.define("ERANGE", "34");

        // stdio / time constants
        self.define("SEEK_SET", "0");
        self.define("SEEK_CUR", "1");
        self.define("SEEK_END", "2");
        self.define("CLOCKS_PER_SEC", "1000");
        self.define("time_t", "long");
        self.define("clock_t", "long");

        // signal.h
        self.define("sig_atomic_t", "int");
        self.define("SIGINT", "2");
        self.define("SIGTERM", "15");
        self.define("SIG_DFL", "((void(*)(int))0)");
        self.define("SIG_IGN", "((void(*)(int))1)");

        self.define("BUFSIZ", "8192");
        self.define("EXIT_SUCCESS", "0");
        self.define("EXIT_FAILURE", "1");
    }

    /// Preprocess a whole file and return the expanded text.
    pub fn run(&mut self, src: &str, filename: &str) -> String {
        self.process_file(src.as_bytes(), filename);
        let bytes = std::mem::take(&mut self.out);
        String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
    }

    fn push_str(&mut self, s: &str) {
        self.out.extend_from_slice(s.as_bytes());
    }

    fn process_file(&mut self, src: &[u8], filename: &str) {
        self.push_str(&format!("# 1 \"{}\"\n", filename));

        let mut cur = Cursor::new(src);
        let mut if_depth: i32 = 0;
        let mut skip_depth: i32 = 0;
        let mut in_block_comment = false;

        while !cur.at_end() {
            let line_ws_start = cur.pos;
            cur.skip_ws_inline();

            if cur.byte(0) == b'#' && !in_block_comment {
                cur.pos += 1;
                cur.skip_ws_inline();
                let Some(dir) = cur.read_ident() else {
                    cur.skip_line();
                    continue;
                };
                match dir.as_str() {
                    "if" => {
                        if_depth += 1;
                        if skip_depth > 0 {
                            skip_depth += 1;
                            cur.skip_line();
                        } else {
                            let expr = cur.read_line();
                            if self.eval_condition(&expr, filename, cur.line) == 0 {
                                skip_depth = 1;
                            }
                        }
                    }
                    "ifdef" => {
                        if_depth += 1;
                        cur.skip_ws_inline();
                        let name = cur.read_ident();
                        cur.skip_line();
                        if skip_depth > 0 {
                            skip_depth += 1;
                        } else if !name.map(|n| self.macro_defined(&n)).unwrap_or(false) {
                            skip_depth = 1;
                        }
                    }
                    "ifndef" => {
                        if_depth += 1;
                        cur.skip_ws_inline();
                        let name = cur.read_ident();
                        cur.skip_line();
                        if skip_depth > 0 {
                            skip_depth += 1;
                        } else if name.map(|n| self.macro_defined(&n)).unwrap_or(false) {
                            skip_depth = 1;
                        }
                    }
                    "elif" => {
                        if skip_depth == 1 {
                            let expr = cur.read_line();
                            if self.eval_condition(&expr, filename, cur.line) != 0 {
                                skip_depth = 0;
                            }
                        } else if skip_depth == 0 {
                            skip_depth = 1;
                            cur.skip_line();
                        } else {
                            cur.skip_line();
                        }
                    }
                    "else" => {
                        cur.skip_line();
                        if skip_depth == 1 {
                            skip_depth = 0;
                        } else if skip_depth == 0 {
                            skip_depth = 1;
                        }
                    }
                    "endif" => {
                        cur.skip_line();
                        if skip_depth > 0 {
                            skip_depth -= 1;
                        }
                        if_depth -= 1;
                        if if_depth < 0 {
                            self.sess.error(format!("{}: #endif without #if", filename));
                            if_depth = 0;
                        }
                    }
                    _ if skip_depth > 0 => {
                        cur.skip_line();
                    }
                    "define" => {
                        cur.skip_ws_inline();
                        let Some(name) = cur.read_ident() else {
                            cur.skip_line();
                            continue;
                        };
                        let mut params: Option<Vec<String>> = None;
                        let mut is_variadic = false;
                        // Function-like only when ( follows the name with no space.
                        if cur.byte(0) == b'(' {
                            cur.pos += 1;
                            let mut list = Vec::new();
                            cur.skip_ws_inline();
                            while !cur.at_end() && cur.byte(0) != b')' {
                                cur.skip_ws_inline();
                                if cur.byte(0) == b'.' && cur.byte(1) == b'.' && cur.byte(2) == b'.'
                                {
                                    is_variadic = true;
                                    cur.pos += 3;
                                    break;
                                }
                                if let Some(p) = cur.read_ident() {
                                    list.push(p);
                                }
                                cur.skip_ws_inline();
                                if cur.byte(0) == b',' {
                                    cur.pos += 1;
                                }
                            }
                            if cur.byte(0) == b')' {
                                cur.pos += 1;
                            }
                            params = Some(list);
                        }
                        let body = cur.read_line();
                        let atom = self.sess.interner.intern(&name);
                        self.macros.insert(
                            atom,
                            Macro {
                                body,
                                params,
                                is_variadic,
                            },
                        );
                    }
                    "undef" => {
                        cur.skip_ws_inline();
                        if let Some(name) = cur.read_ident() {
                            self.undef(&name);
                        }
                        cur.skip_line();
                    }
                    "include" => {
                        cur.skip_ws_inline();
                        let (path, is_system) = match cur.byte(0) {
                            b'<' => {
                                cur.pos += 1;
                                let start = cur.pos;
                                while !cur.at_end() && cur.byte(0) != b'>' {
                                    cur.pos += 1;
                                }
                                let p = String::from_utf8_lossy(&cur.src[start..cur.pos])
                                    .into_owned();
                                if cur.byte(0) == b'>' {
                                    cur.pos += 1;
                                }
                                (p, true)
                            }
                            b'"' => {
                                cur.pos += 1;
                                let start = cur.pos;
                                while !cur.at_end() && cur.byte(0) != b'"' {
                                    cur.pos += 1;
                                }
                                let p = String::from_utf8_lossy(&cur.src[start..cur.pos])
                                    .into_owned();
                                if cur.byte(0) == b'"' {
                                    cur.pos += 1;
                                }
                                (p, false)
                            }
                            _ => {
                                self.sess.error("expected filename after #include");
                                cur.skip_line();
                                continue;
                            }
                        };
                        cur.skip_line();
                        self.include(&path, is_system, filename);
                        self.push_str(&format!("# {} \"{}\"\n", cur.line, filename));
                    }
                    "pragma" => {
                        cur.skip_line();
                    }
                    "error" => {
                        cur.skip_ws_inline();
                        let msg = cur.read_line();
                        self.sess.error(format!("#error {}", msg));
                    }
                    "line" => {
                        cur.skip_ws_inline();
                        let mut n: u32 = 0;
                        let mut saw_digit = false;
                        while cur.byte(0).is_ascii_digit() {
                            n = n.wrapping_mul(10).wrapping_add((cur.byte(0) - b'0') as u32);
                            cur.pos += 1;
                            saw_digit = true;
                        }
                        if saw_digit {
                            cur.line = n;
                        }
                        cur.skip_line();
                    }
                    _ => {
                        cur.skip_line();
                    }
                }
                continue;
            }

            // Not a directive: restore position to keep leading whitespace.
            cur.pos = line_ws_start;

            if skip_depth > 0 {
                if cur.byte(0) == b'\n' || cur.byte(0) == b'\r' {
                    let c = cur.advance();
                    self.out.push(c);
                } else {
                    cur.pos += 1;
                }
                continue;
            }

            if cur.byte(0) == b'\n' || cur.byte(0) == b'\r' {
                let c = cur.advance();
                self.out.push(c);
                continue;
            }

            let line_no = cur.line;
            let text = read_balanced_line(&mut cur, &mut in_block_comment);
            let mut expanded = Vec::new();
            self.expand(&text, &mut expanded, filename, line_no, 0);
            self.out.extend_from_slice(&expanded);
        }

        if if_depth != 0 {
            self.sess
                .error(format!("{}: unterminated #if (missing #endif)", filename));
        }
    }

    /// Evaluate a `#if`/`#elif` expression: `defined` first, then macro
    /// expansion, then constant evaluation.
    fn eval_condition(&mut self, expr: &str, filename: &str, line: u32) -> i64 {
        let replaced = self.replace_defined(expr);
        let mut expanded = Vec::new();
        self.expand(replaced.as_bytes(), &mut expanded, filename, line, 0);
        cond_expr::eval(&String::from_utf8_lossy(&expanded))
    }

    /// Replace `defined X` / `defined(X)` with 1 or 0 before any macro
    /// expansion, so the operand itself is never expanded.
    fn replace_defined(&mut self, expr: &str) -> String {
        let bytes = expr.as_bytes();
        let mut out = String::new();
        let mut i = 0;
        while i < bytes.len() {
            let rest = &bytes[i..];
            let at_ident_boundary = i == 0
                || !(bytes[i - 1].is_ascii_alphanumeric() || bytes[i - 1] == b'_');
            if at_ident_boundary
                && rest.starts_with(b"defined")
                && !rest
                    .get(7)
                    .map(|c| c.is_ascii_alphanumeric() || *c == b'_')
                    .unwrap_or(false)
            {
                i += 7;
                while bytes.get(i) == Some(&b' ') || bytes.get(i) == Some(&b'\t') {
                    i += 1;
                }
                let paren = bytes.get(i) == Some(&b'(');
                if paren {
                    i += 1;
                }
                while bytes.get(i) == Some(&b' ') || bytes.get(i) == Some(&b'\t') {
                    i += 1;
                }
                let start = i;
                while bytes
                    .get(i)
                    .map(|c| c.is_ascii_alphanumeric() || *c == b'_')
                    .unwrap_or(false)
                {
                    i += 1;
                }
                let name = String::from_utf8_lossy(&bytes[start..i]).into_owned();
                if paren {
                    while bytes.get(i) == Some(&b' ') || bytes.get(i) == Some(&b'\t') {
                        i += 1;
                    }
                    if bytes.get(i) == Some(&b')') {
                        i += 1;
                    }
                }
                out.push(if self.macro_defined(&name) { '1' } else { '0' });
            } else {
                out.push(bytes[i] as char);
                i += 1;
            }
        }
        out
    }

    /// Macro expansion with rescanning, bounded by `MAX_EXPANSION_DEPTH`.
    /// Text inside string and character literals is never expanded.
    fn expand(&mut self, input: &[u8], out: &mut Vec<u8>, filename: &str, line: u32, depth: u32) {
        if depth > MAX_EXPANSION_DEPTH {
            out.extend_from_slice(input);
            return;
        }
        let mut i = 0;
        while i < input.len() {
            let c = input[i];

            // String literal: copy verbatim.
            if c == b'"' {
                out.push(c);
                i += 1;
                while i < input.len() && input[i] != b'"' {
                    if input[i] == b'\\' && i + 1 < input.len() {
                        out.push(input[i]);
                        i += 1;
                    }
                    out.push(input[i]);
                    i += 1;
                }
                if i < input.len() {
                    out.push(input[i]);
                    i += 1;
                }
                continue;
            }
            // Character literal: copy verbatim.
            if c == b'\'' {
                out.push(c);
                i += 1;
                while i < input.len() && input[i] != b'\'' {
                    if input[i] == b'\\' && i + 1 < input.len() {
                        out.push(input[i]);
                        i += 1;
                    }
                    out.push(input[i]);
                    i += 1;
                }
                if i < input.len() {
                    out.push(input[i]);
                    i += 1;
                }
                continue;
            }

            if c.is_ascii_alphabetic() || c == b'_' {
                let start = i;
                while i < input.len()
                    && (input[i].is_ascii_alphanumeric() || input[i] == b'_')
                {
                    i += 1;
                }
                let name = String::from_utf8_lossy(&input[start..i]).into_owned();

                // Dynamic built-ins.
                match name.as_str() {
                    "__LINE__" => {
                        out.extend_from_slice(line.to_string().as_bytes());
                        continue;
                    }
                    "__FILE__" => {
                        out.extend_from_slice(format!("\"{}\"", filename).as_bytes());
                        continue;
                    }
                    "__DATE__" => {
                        let date = Local::now().format("\"%b %d %Y\"").to_string();
                        out.extend_from_slice(date.as_bytes());
                        continue;
                    }
                    "__TIME__" => {
                        let time = Local::now().format("\"%H:%M:%S\"").to_string();
                        out.extend_from_slice(time.as_bytes());
                        continue;
                    }
                    _ => {}
                }

                let mac = self.find_macro(&name);
                match mac {
                    Some(m) if m.params.is_none() => {
                        self.expand(m.body.as_bytes(), out, filename, line, depth + 1);
                        continue;
                    }
                    Some(m) if i < input.len() && input[i] == b'(' => {
                        i += 1; // (
                        let args = collect_args(input, &mut i);
                        let substituted = substitute_params(&m, &args);
                        self.expand(substituted.as_bytes(), out, filename, line, depth + 1);
                        continue;
                    }
                    _ => {
                        out.extend_from_slice(&input[start..i]);
                        continue;
                    }
                }
            }

            out.push(c);
            i += 1;
        }
    }

    /// Resolve and splice an `#include`. Quoted includes search the current
    /// file's directory, the working directory, then `-I` paths; angle
    /// includes fall back to the runtime-provided standard header stubs.
    fn include(&mut self, path: &str, is_system: bool, current_file: &str) {
        let mut content: Option<(String, String)> = None;

        if !is_system {
            if let Some(dir) = Path::new(current_file).parent() {
                let candidate = dir.join(path);
                if let Ok(text) = fs::read_to_string(&candidate) {
                    content = Some((text, candidate.to_string_lossy().into_owned()));
                }
            }
        }
        if content.is_none() {
            if let Ok(text) = fs::read_to_string(path) {
                content = Some((text, path.to_string()));
            }
        }
        if content.is_none() {
            for dir in &self.include_paths {
                let candidate = dir.join(path);
                if let Ok(text) = fs::read_to_string(&candidate) {
                    content = Some((text, candidate.to_string_lossy().into_owned()));
                    break;
                }
            }
        }

        match content {
            Some((text, fullpath)) => {
                self.process_file(text.as_bytes(), &fullpath);
                self.out.push(b'\n');
            }
            None => {
                if RUNTIME_HEADERS.contains(&path) {
                    self.push_str(&format!("\n/* #include <{}> provided by runtime */\n", path));
                } else {
                    self.sess
                        .error(format!("cannot find include file '{}'", path));
                }
            }
        }
    }
}

/// Collect comma-separated macro arguments starting just past the opening
/// parenthesis, honoring nested parens and string/char literals. The cursor
/// ends past the closing parenthesis.
fn collect_args(input: &[u8], i: &mut usize) -> Vec<String> {
    let mut args = Vec::new();
    let mut depth = 1;
    while depth > 0 && *i < input.len() {
        while input.get(*i) == Some(&b' ') || input.get(*i) == Some(&b'\t') {
            *i += 1;
        }
        let mut arg: Vec<u8> = Vec::new();
        while *i < input.len() && depth > 0 {
            let c = input[*i];
            match c {
                b'(' => {
                    depth += 1;
                    arg.push(c);
                    *i += 1;
                }
                b')' => {
                    depth -= 1;
                    if depth > 0 {
                        arg.push(c);
                    }
                    *i += 1;
                    if depth == 0 {
                        break;
                    }
                }
                b',' if depth == 1 => {
                    *i += 1;
                    break;
                }
                b'"' | b'\'' => {
                    let quote = c;
                    arg.push(c);
                    *i += 1;
                    while *i < input.len() && input[*i] != quote {
                        if input[*i] == b'\\' && *i + 1 < input.len() {
                            arg.push(input[*i]);
                            *i += 1;
                        }
                        arg.push(input[*i]);
                        *i += 1;
                    }
                    if *i < input.len() {
                        arg.push(input[*i]);
                        *i += 1;
                    }
                }
                _ => {
                    arg.push(c);
                    *i += 1;
                }
            }
        }
        args.push(String::from_utf8_lossy(&arg).into_owned());
    }
    args
}

/// Substitute arguments into a function-like macro body, handling `#`
/// stringification, `##` pasting, and `__VA_ARGS__`.
fn substitute_params(mac: &Macro, args: &[String]) -> String {
    let params: &[String] = mac.params.as_deref().unwrap_or(&[]);
    let body = mac.body.as_bytes();
    let mut out: Vec<u8> = Vec::new();
    let mut i = 0;

    while i < body.len() {
        let c = body[i];
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = i;
            while i < body.len() && (body[i].is_ascii_alphanumeric() || body[i] == b'_') {
                i += 1;
            }
            let word = &body[start..i];
            if word == b"__VA_ARGS__" {
                for (n, extra) in args.iter().skip(params.len()).enumerate() {
                    if n > 0 {
                        out.push(b',');
                    }
                    out.extend_from_slice(extra.as_bytes());
                }
                continue;
            }
            if let Some(idx) = params.iter().position(|p| p.as_bytes() == word) {
                if let Some(arg) = args.get(idx) {
                    out.extend_from_slice(arg.as_bytes());
                }
                continue;
            }
            out.extend_from_slice(word);
            continue;
        }
        if c == b'#' && body.get(i + 1) == Some(&b'#') {
            // Token pasting: delete surrounding whitespace.
            while matches!(out.last(), Some(b' ') | Some(b'\t')) {
                out.pop();
            }
            i += 2;
            while body.get(i) == Some(&b' ') || body.get(i) == Some(&b'\t') {
                i += 1;
            }
            continue;
        }
        if c == b'#' {
            // Stringification of the following parameter.
            i += 1;
            while body.get(i) == Some(&b' ') || body.get(i) == Some(&b'\t') {
                i += 1;
            }
            let start = i;
            while i < body.len() && (body[i].is_ascii_alphanumeric() || body[i] == b'_') {
                i += 1;
            }
            let word = &body[start..i];
            if let Some(idx) = params.iter().position(|p| p.as_bytes() == word) {
                out.push(b'"');
                if let Some(arg) = args.get(idx) {
                    for &b in arg.as_bytes() {
                        if b == b'"' || b == b'\\' {
                            out.push(b'\\');
                        }
                        out.push(b);
                    }
                }
                out.push(b'"');
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Read one logical source line. When parentheses are left unbalanced
/// outside strings, chars, and comments (a multi-line macro invocation),
/// subsequent physical lines are joined with spaces. A block comment left
/// open carries over via `in_block_comment`.
fn read_balanced_line(cur: &mut Cursor<'_>, in_block_comment: &mut bool) -> Vec<u8> {
    let mut line: Vec<u8> = Vec::new();
    let mut paren_depth: i32 = 0;
    let mut in_string = false;
    let mut in_char = false;

    loop {
        while !cur.at_end() && cur.byte(0) != b'\n' && cur.byte(0) != b'\r' {
            let cont = cur.continuation_len();
            if cont > 0 {
                cur.pos += cont;
                cur.line += 1;
                continue;
            }
            let c = cur.byte(0);
            if *in_block_comment {
                if c == b'*' && cur.byte(1) == b'/' {
                    line.push(cur.byte(0));
                    cur.pos += 1;
                    line.push(cur.byte(0));
                    cur.pos += 1;
                    *in_block_comment = false;
                } else {
                    line.push(c);
                    cur.pos += 1;
                }
                continue;
            }
            if !in_string && !in_char {
                if c == b'/' && cur.byte(1) == b'*' {
                    *in_block_comment = true;
                    line.push(cur.byte(0));
                    cur.pos += 1;
                    line.push(cur.byte(0));
                    cur.pos += 1;
                    continue;
                }
                if c == b'/' && cur.byte(1) == b'/' {
                    while !cur.at_end() && cur.byte(0) != b'\n' && cur.byte(0) != b'\r' {
                        line.push(cur.byte(0));
                        cur.pos += 1;
                    }
                    break;
                }
                match c {
                    b'"' => in_string = true,
                    b'\'' => in_char = true,
                    b'(' => paren_depth += 1,
                    b')' => {
                        if paren_depth > 0 {
                            paren_depth -= 1;
                        }
                    }
                    _ => {}
                }
            } else if in_string {
                if c == b'\\' && cur.byte(1) != 0 {
                    line.push(cur.byte(0));
                    cur.pos += 1;
                } else if c == b'"' {
                    in_string = false;
                }
            } else if in_char {
                if c == b'\\' && cur.byte(1) != 0 {
                    line.push(cur.byte(0));
                    cur.pos += 1;
                } else if c == b'\'' {
                    in_char = false;
                }
            }
            line.push(cur.byte(0));
            cur.pos += 1;
        }

        if paren_depth <= 0 && !*in_block_comment {
            break;
        }
        // Unbalanced: replace the newline with a space and keep reading.
        if cur.at_end() {
            break;
        }
        cur.advance();
        line.push(b' ');
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pp(src: &str) -> (String, u32) {
        let mut sess = Session::new();
        let mut pp = Preprocessor::new(&mut sess, Vec::new());
        let out = pp.run(src, "test.c");
        let errors = sess.diags.error_count();
        (out, errors)
    }

    fn pp_clean(src: &str) -> String {
        let (out, errors) = pp(src);
        assert_eq!(errors, 0, "unexpected errors in: {}", src);
        out
    }

    #[test]
    fn plain_text_passes_through_with_line_marker() {
        let out = pp_clean("int x = 1;\n");
        assert!(out.starts_with("# 1 \"test.c\"\n"));
        assert!(out.contains("int x = 1;\n"));
    }

    #[test]
    fn object_macro_expands_with_rescanning() {
        let out = pp_clean("#define A B\n#define B 42\nint x = A;\n");
        assert!(out.contains("int x = 42;"));
    }

    #[test]
    fn function_macro_with_args() {
        let out = pp_clean("#define MAX(a, b) ((a) > (b) ? (a) : (b))\nint m = MAX(3+1, 2);\n");
        assert!(out.contains("int m = ((3+1) > (2) ? (3+1) : (2));"));
    }

    #[test]
    fn stringification_escapes_quotes() {
        let out = pp_clean("#define S(x) #x\nconst char *s = S(a \"b\");\n");
        assert!(out.contains(r#""a \"b\"""#));
    }

    #[test]
    fn token_pasting_joins_tokens() {
        let out = pp_clean("#define GLUE(a, b) a ## b\nint GLUE(foo, bar) = 1;\n");
        assert!(out.contains("int foobar = 1;"));
    }

    #[test]
    fn va_args_joins_remaining_arguments() {
        let out = pp_clean("#define CALL(f, ...) f(__VA_ARGS__)\nCALL(g, 1, 2, 3);\n");
        assert!(out.contains("g(1,2,3);"));
    }

    #[test]
    fn conditionals_select_branches() {
        let out = pp_clean("#define FOO 1\n#ifdef FOO\nint yes;\n#else\nint no;\n#endif\n");
        assert!(out.contains("int yes;"));
        assert!(!out.contains("int no;"));
    }

    #[test]
    fn ifndef_and_undef() {
        let out = pp_clean("#define X 1\n#undef X\n#ifndef X\nint absent;\n#endif\n");
        assert!(out.contains("int absent;"));
    }

    #[test]
    fn if_with_defined_operator() {
        let out = pp_clean(
            "#define A 1\n#if defined(A) && !defined B\nint taken;\n#else\nint other;\n#endif\n",
        );
        assert!(out.contains("int taken;"));
        assert!(!out.contains("int other;"));
    }

    #[test]
    fn elif_chains() {
        let out = pp_clean("#define V 2\n#if V == 1\nint a;\n#elif V == 2\nint b;\n#else\nint c;\n#endif\n");
        assert!(out.contains("int b;"));
        assert!(!out.contains("int a;"));
        assert!(!out.contains("int c;"));
    }

    #[test]
    fn nested_skipped_conditionals_stay_balanced() {
        let out = pp_clean("#if 0\n#if 1\nint inner;\n#endif\nint outer;\n#endif\nint after;\n");
        assert!(!out.contains("int inner;"));
        assert!(!out.contains("int outer;"));
        assert!(out.contains("int after;"));
    }

    #[test]
    fn undefined_identifier_in_if_is_zero() {
        let out = pp_clean("#if MYSTERY\nint a;\n#else\nint b;\n#endif\n");
        assert!(out.contains("int b;"));
    }

    #[test]
    fn line_macro_tracks_lines() {
        let out = pp_clean("int a = __LINE__;\nint b = __LINE__;\n");
        assert!(out.contains("int a = 1;"));
        assert!(out.contains("int b = 2;"));
    }

    #[test]
    fn file_macro_quotes_name() {
        let out = pp_clean("const char *f = __FILE__;\n");
        assert!(out.contains("const char *f = \"test.c\";"));
    }

    #[test]
    fn strings_are_never_expanded() {
        let out = pp_clean("#define FOO 1\nconst char *s = \"FOO\";\n");
        assert!(out.contains("\"FOO\""));
    }

    #[test]
    fn standard_headers_stub_to_runtime() {
        let out = pp_clean("#include <stdio.h>\nint x;\n");
        assert!(out.contains("/* #include <stdio.h> provided by runtime */"));
        assert!(out.contains("int x;"));
    }

    #[test]
    fn missing_include_is_an_error() {
        let (_, errors) = pp("#include \"no_such_file_anywhere.h\"\n");
        assert_eq!(errors, 1);
    }

    #[test]
    fn error_directive_reports() {
        let (_, errors) = pp("#error something is wrong\n");
        assert_eq!(errors, 1);
    }

    #[test]
    fn pragma_is_ignored() {
        let (out, errors) = pp("#pragma once\nint x;\n");
        assert_eq!(errors, 0);
        assert!(out.contains("int x;"));
    }

    #[test]
    fn unterminated_if_is_an_error() {
        let (_, errors) = pp("#if 1\nint x;\n");
        assert_eq!(errors, 1);
    }

    #[test]
    fn continuation_joins_macro_bodies() {
        let out = pp_clean("#define SUM(a, b) \\\n  ((a) + (b))\nint s = SUM(1, 2);\n");
        assert!(out.contains("int s = ((1) + (2));"));
    }

    #[test]
    fn multiline_invocation_is_joined() {
        let out = pp_clean("#define PAIR(a, b) a + b\nint s = PAIR(1,\n            2);\n");
        assert!(out.contains("1 + 2"));
    }

    #[test]
    fn builtin_macros_are_present() {
        let out = pp_clean("long v = __STDC_VERSION__;\nint m = INT_MAX;\nsize_t s;\n");
        assert!(out.contains("long v = 199901L;"));
        assert!(out.contains("int m = 2147483647;"));
        assert!(out.contains("unsigned int s;"));
    }

    #[test]
    fn recursion_depth_is_bounded() {
        let (out, errors) = pp("#define LOOP LOOP x\nint LOOP;\n");
        assert_eq!(errors, 0);
        assert!(out.contains("LOOP"));
    }

    #[test]
    fn cli_defines_take_effect() {
        let mut sess = Session::new();
        let mut pp = Preprocessor::new(&mut sess, Vec::new());
        pp.define("DEBUG", "1");
        let out = pp.run("#ifdef DEBUG\nint dbg;\n#endif\n", "t.c");
        assert!(out.contains("int dbg;"));
    }
}
