//! Sandboxed evaluation of filter predicates and fact transformations.
//!
//! Scripts are written in a small JavaScript-like language:
//!
//! ```text
//! function (h, e) { return h.meta.tenant == 'a' && e.amount > 10 }
//! function (e) { e.displayName = e.firstName + ' ' + e.lastName; delete e.legacy; }
//! ```
//!
//! There are no loops, calls, globals or I/O, so every evaluation is a pure
//! function of its arguments and terminates.
//!
//! A program may define several functions. Transformations run each of them
//! in order on the same payload, which is how a transformation chain is
//! composed into one program.

mod eval;
mod lexer;
mod parser;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Arc;
use thiserror::Error;

use parser::{Function, Parser};

/// Failure to compile or evaluate a script.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ScriptError {
    #[error("syntax error at {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("expected a function with {expected} parameter(s), got {got}")]
    Arity { expected: String, got: usize },

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl ScriptError {
    pub(crate) fn syntax(pos: usize, message: impl Into<String>) -> Self {
        ScriptError::Syntax {
            pos,
            message: message.into(),
        }
    }
}

/// A compiled script.
#[derive(Debug)]
pub struct Program {
    functions: Vec<Function>,
}

impl Program {
    /// Parse a script.
    pub fn compile(source: &str) -> Result<Self, ScriptError> {
        let tokens = lexer::tokenize(source)?;
        let functions = Parser::new(tokens, source.len()).parse_program()?;
        Ok(Self { functions })
    }

    /// Number of functions defined by the script.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Apply every function in order to `payload`.
    ///
    /// A function may mutate its argument in place or return a replacement
    /// object.
    pub fn transform(&self, payload: Value) -> Result<Value, ScriptError> {
        let mut current = payload;
        for function in &self.functions {
            let Some(param) = function.params.first() else {
                return Err(ScriptError::Arity {
                    expected: "1".into(),
                    got: 0,
                });
            };
            let mut scope = eval::Scope::bind(function, vec![current]);
            let returned = eval::call(function, &mut scope)?;
            current = match returned {
                Value::Object(_) => returned,
                _ => scope.take(param),
            };
        }
        Ok(current)
    }
}

/// A compiled filter predicate over a fact's header and optionally its payload.
#[derive(Clone, Debug)]
pub struct Predicate {
    program: Arc<Program>,
}

impl Predicate {
    fn new(program: Arc<Program>) -> Result<Self, ScriptError> {
        if program.functions.len() != 1 {
            return Err(ScriptError::Arity {
                expected: "a single function with 1 or 2".into(),
                got: program.functions.len(),
            });
        }
        let params = program.functions[0].params.len();
        if !(1..=2).contains(&params) {
            return Err(ScriptError::Arity {
                expected: "1 or 2".into(),
                got: params,
            });
        }
        Ok(Self { program })
    }

    /// Whether the predicate declares a payload parameter.
    pub fn wants_payload(&self) -> bool {
        self.program.functions[0].params.len() == 2
    }

    /// Evaluate against a header and, for two-parameter predicates, a payload.
    pub fn test(&self, header: &Value, payload: Option<&Value>) -> Result<bool, ScriptError> {
        let function = &self.program.functions[0];
        let mut args = vec![header.clone()];
        if self.wants_payload() {
            args.push(payload.cloned().unwrap_or(Value::Null));
        }
        let mut scope = eval::Scope::bind(function, args);
        let result = eval::call(function, &mut scope)?;
        Ok(eval::truthy(&result))
    }
}

/// Compiles scripts and caches the compiled forms by source digest.
pub struct ScriptEngine {
    cache: Mutex<LruCache<String, Arc<Program>>>,
}

impl ScriptEngine {
    /// Create an engine caching up to `capacity` compiled programs.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Compile a program, reusing a cached compilation of identical source.
    pub fn compile(&self, source: &str) -> Result<Arc<Program>, ScriptError> {
        let digest = hex::encode(Sha256::digest(source.as_bytes()));

        if let Some(program) = self.cache.lock().get(&digest).cloned() {
            return Ok(program);
        }

        let program = Arc::new(Program::compile(source)?);
        self.cache.lock().put(digest, Arc::clone(&program));
        Ok(program)
    }

    /// Compile a filter predicate.
    pub fn predicate(&self, source: &str) -> Result<Predicate, ScriptError> {
        Predicate::new(self.compile(source)?)
    }

    /// Run a transformation program on a payload.
    pub fn transform(&self, source: &str, payload: Value) -> Result<Value, ScriptError> {
        self.compile(source)?.transform(payload)
    }

    /// Number of cached programs.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(256)
    }
}
