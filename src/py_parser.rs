use std::borrow::Cow;
use std::{fs, path::Path};

use rustpython_parser::{
    ast::{ExceptHandler, Expr, Ranged, Stmt, StmtClassDef, Suite},
    Parse,
};

use crate::error::ExtractError;
use crate::model::TestRecord;

const TRIGGER_TERMS: [&str; 3] = ["test", "unittest", "pytest"];

/// Cheap text check run before parsing. Files that fail it cannot hold tests.
pub fn might_contain_tests(content: &str) -> bool {
    let lowered = content.to_lowercase();
    TRIGGER_TERMS.iter().any(|term| lowered.contains(term))
}

pub fn find_tests_in_source(p: &Path) -> Result<Vec<TestRecord>, ExtractError> {
    let bytes = fs::read(p).map_err(|e| ExtractError::Processing(e.to_string()))?;
    let content = String::from_utf8_lossy(&bytes);
    find_tests_in_text(&content, &p.to_string_lossy())
}

pub fn find_tests_in_text(content: &str, file: &str) -> Result<Vec<TestRecord>, ExtractError> {
    if !might_contain_tests(content) {
        return Ok(Vec::new());
    }

    let (source, program) = parse_with_repair(content, file)?;
    let mut collector = TestCollector {
        source: &source,
        file,
        tests: Vec::new(),
    };
    collector.visit_body(&program);
    Ok(collector.tests)
}

/// Parses the module, and if that fails, parses it once more after
/// [`repair_fstring_quotes`]. The returned text is the one the tree was
/// built from; the repair keeps byte offsets stable.
pub fn parse_with_repair<'a>(
    content: &'a str,
    file: &str,
) -> Result<(Cow<'a, str>, Suite), ExtractError> {
    if let Ok(program) = Suite::parse(content, file) {
        return Ok((Cow::Borrowed(content), program));
    }

    let repaired = repair_fstring_quotes(content);
    match Suite::parse(&repaired, file) {
        Ok(program) => Ok((Cow::Owned(repaired), program)),
        Err(e) => Err(ExtractError::Syntax(e.to_string())),
    }
}

/// Rewrites string literals nested inside f-string replacement fields that
/// reuse the enclosing quote, e.g. `f'{d['k']}'` becomes `f'{d["k"]}'`.
/// Only single-line f-strings are touched.
pub fn repair_fstring_quotes(source: &str) -> String {
    let chars: Vec<char> = source.chars().collect();
    let mut out = String::with_capacity(source.len());
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let triple = chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c);
                i = if triple {
                    copy_triple_quoted(&chars, i, &mut out)
                } else if string_prefix(&chars, i).map_or(false, |p| p.contains(['f', 'F'])) {
                    copy_fstring_repaired(&chars, i, &mut out)
                } else {
                    copy_single_quoted(&chars, i, &mut out)
                };
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}

fn string_prefix(chars: &[char], quote: usize) -> Option<String> {
    let mut start = quote;
    while start > 0 && chars[start - 1].is_ascii_alphabetic() {
        start -= 1;
    }
    if start > 0 && (chars[start - 1].is_alphanumeric() || chars[start - 1] == '_') {
        return None;
    }
    let prefix: String = chars[start..quote].iter().collect();
    let valid = prefix.len() <= 2 && prefix.chars().all(|c| "rRbBuUfF".contains(c));
    valid.then_some(prefix)
}

fn copy_triple_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    let q = chars[start];
    out.extend([q, q, q]);
    let mut i = start + 3;
    while i < chars.len() {
        if chars[i] == '\\' {
            out.extend(chars[i..(i + 2).min(chars.len())].iter());
            i += 2;
            continue;
        }
        if chars[i] == q && chars.get(i + 1) == Some(&q) && chars.get(i + 2) == Some(&q) {
            out.extend([q, q, q]);
            return i + 3;
        }
        out.push(chars[i]);
        i += 1;
    }
    chars.len()
}

fn copy_single_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    let q = chars[start];
    out.push(q);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            out.extend(chars[i..(i + 2).min(chars.len())].iter());
            i += 2;
            continue;
        }
        out.push(c);
        i += 1;
        if c == q || c == '\n' {
            return i;
        }
    }
    i.min(chars.len())
}

fn copy_fstring_repaired(chars: &[char], start: usize, out: &mut String) -> usize {
    let q = chars[start];
    let other = if q == '\'' { '"' } else { '\'' };
    out.push(q);
    let mut depth = 0usize;
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            out.extend(chars[i..(i + 2).min(chars.len())].iter());
            i += 2;
            continue;
        }
        if c == '\n' {
            out.push(c);
            return i + 1;
        }
        if depth == 0 {
            out.push(c);
            i += 1;
            match c {
                c if c == q => return i,
                '{' if chars.get(i) == Some(&'{') => {
                    out.push('{');
                    i += 1;
                }
                '{' => depth = 1,
                _ => {}
            }
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            _ => {}
        }
        out.push(if c == q { other } else { c });
        i += 1;
    }
    i.min(chars.len())
}

/// Borrowed view over sync and async function definitions.
struct FunctionDef<'a> {
    name: &'a str,
    decorators: &'a [Expr],
    body: &'a [Stmt],
    start: usize,
    end: usize,
}

impl<'a> FunctionDef<'a> {
    fn from_stmt(stmt: &'a Stmt) -> Option<Self> {
        match stmt {
            Stmt::FunctionDef(f) => Some(Self {
                name: f.name.as_str(),
                decorators: &f.decorator_list,
                body: &f.body,
                start: usize::from(f.range.start()),
                end: usize::from(f.range.end()),
            }),
            Stmt::AsyncFunctionDef(f) => Some(Self {
                name: f.name.as_str(),
                decorators: &f.decorator_list,
                body: &f.body,
                start: usize::from(f.range.start()),
                end: usize::from(f.range.end()),
            }),
            _ => None,
        }
    }
}

// Test detection heuristics. Any one of them is enough.

fn has_test_name(name: &str) -> bool {
    name.starts_with("test_") || name.ends_with("_test")
}

fn is_mark_call(decorator: &Expr) -> bool {
    match decorator {
        Expr::Call(call) => {
            matches!(*call.func, Expr::Attribute(_)) && chain_contains(&call.func, "mark")
        }
        _ => false,
    }
}

fn chain_contains(expr: &Expr, segment: &str) -> bool {
    match expr {
        Expr::Attribute(attr) => attr.attr.as_str() == segment || chain_contains(&attr.value, segment),
        Expr::Name(name) => name.id.as_str() == segment,
        _ => false,
    }
}

fn is_test_named_decorator(decorator: &Expr) -> bool {
    match decorator {
        Expr::Name(name) => name.id.as_str().to_lowercase().contains("test"),
        _ => false,
    }
}

fn is_test_fn(f: &FunctionDef) -> bool {
    has_test_name(f.name)
        || f.decorators
            .iter()
            .any(|d| is_mark_call(d) || is_test_named_decorator(d))
}

fn is_test_case_class(class: &StmtClassDef) -> bool {
    class.bases.iter().any(|base| match base {
        Expr::Name(name) => name.id.as_str().contains("TestCase"),
        Expr::Attribute(attr) => attr.attr.as_str().contains("TestCase"),
        _ => false,
    })
}

struct TestCollector<'a> {
    source: &'a str,
    file: &'a str,
    tests: Vec<TestRecord>,
}

impl TestCollector<'_> {
    fn visit_body(&mut self, body: &[Stmt]) {
        for stmt in body {
            self.visit_stmt(stmt);
        }
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        if let Some(f) = FunctionDef::from_stmt(stmt) {
            if is_test_fn(&f) {
                self.push(&f, f.name.to_owned(), None);
            }
            self.visit_body(f.body);
            return;
        }

        match stmt {
            Stmt::ClassDef(class) if is_test_case_class(class) => self.visit_test_case(class),
            Stmt::ClassDef(class) => self.visit_body(&class.body),
            Stmt::For(s) => {
                self.visit_body(&s.body);
                self.visit_body(&s.orelse);
            }
            Stmt::AsyncFor(s) => {
                self.visit_body(&s.body);
                self.visit_body(&s.orelse);
            }
            Stmt::While(s) => {
                self.visit_body(&s.body);
                self.visit_body(&s.orelse);
            }
            Stmt::If(s) => {
                self.visit_body(&s.body);
                self.visit_body(&s.orelse);
            }
            Stmt::With(s) => self.visit_body(&s.body),
            Stmt::AsyncWith(s) => self.visit_body(&s.body),
            Stmt::Match(s) => {
                for case in &s.cases {
                    self.visit_body(&case.body);
                }
            }
            Stmt::Try(s) => {
                self.visit_body(&s.body);
                self.visit_handlers(&s.handlers);
                self.visit_body(&s.orelse);
                self.visit_body(&s.finalbody);
            }
            Stmt::TryStar(s) => {
                self.visit_body(&s.body);
                self.visit_handlers(&s.handlers);
                self.visit_body(&s.orelse);
                self.visit_body(&s.finalbody);
            }
            _ => {}
        }
    }

    fn visit_handlers(&mut self, handlers: &[ExceptHandler]) {
        for handler in handlers {
            let ExceptHandler::ExceptHandler(handler) = handler;
            self.visit_body(&handler.body);
        }
    }

    /// Methods of a `TestCase` subclass named `test*` are reported once,
    /// qualified with the class name. Everything else in the class body goes
    /// through the regular rules.
    fn visit_test_case(&mut self, class: &StmtClassDef) {
        let class_name = class.name.as_str();
        for item in &class.body {
            match FunctionDef::from_stmt(item) {
                Some(method) if method.name.starts_with("test") => {
                    self.push(
                        &method,
                        format!("{}.{}", class_name, method.name),
                        Some(class_name.to_owned()),
                    );
                    self.visit_body(method.body);
                }
                _ => self.visit_stmt(item),
            }
        }
    }

    fn push(&mut self, f: &FunctionDef, name: String, class: Option<String>) {
        let Some(body) = self.source_segment(f).map(str::to_owned) else {
            return;
        };
        self.tests.push(TestRecord {
            name,
            body,
            file: self.file.to_owned(),
            class,
        });
    }

    /// Exact source of a definition, from its first decorator to the end of
    /// its body. `None` when the span does not map onto the source text.
    ///
    /// A nested decorated definition keeps the indentation of its first
    /// decorator line so every line of the slice shares one indent.
    fn source_segment(&self, f: &FunctionDef) -> Option<&str> {
        let start = f
            .decorators
            .iter()
            .map(|d| usize::from(d.start()))
            .fold(f.start, usize::min);
        let line_start = self.source.get(..start)?.rfind('\n').map_or(0, |i| i + 1);
        let before = self.source.get(line_start..start)?;
        let start = match before.trim() {
            "@" => line_start,
            "" => line_start + before.len() - before.trim_start().len(),
            _ => start,
        };
        let segment = self.source.get(start..f.end)?.trim_end();
        (!segment.is_empty()).then_some(segment)
    }
}
