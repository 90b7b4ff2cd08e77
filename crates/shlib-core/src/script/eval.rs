//! Async tree-walking evaluator.
//!
//! One [`Interpreter`] executes one run. It reads library symbols only from
//! the snapshot it was created with, and keeps the per-run singleton
//! instances of global variables.
//!
//! Evaluation recurses through boxed futures, so both the method call depth
//! and the total number of nested evaluation frames are bounded. A run that
//! exceeds either bound fails with a fault instead of exhausting the stack.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};

use super::ast::{AssignTarget, BinaryOp, Expr, MethodDecl, Script, Stmt, StmtKind, UnaryOp, Unit};
use crate::registry::{LibraryDefinition, Snapshot, SymbolKind};

/// Upper bound for the configured method call depth.
pub const MAX_CALL_DEPTH: usize = 40;

/// Nested statement, expression and call frames allowed in one run.
pub const MAX_EVAL_DEPTH: usize = 160;

/// Sink for `echo` output.
pub trait Console: Send + Sync {
    fn echo(&self, line: String);
}

/// Why a run stopped early.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// Raised by the `error` step.
    #[error("{0}")]
    Abort(String),
    /// Evaluation fault, tagged with the source line of the statement.
    #[error("line {line}: {message}")]
    Fault { line: usize, message: String },
}

impl RuntimeError {
    fn fault(message: impl Into<String>) -> Self {
        RuntimeError::Fault {
            line: 0,
            message: message.into(),
        }
    }

    /// Attach `line` unless an inner statement already did.
    fn at(self, line: usize) -> Self {
        match self {
            RuntimeError::Fault { line: 0, message } => RuntimeError::Fault { line, message },
            other => other,
        }
    }
}

type EvalResult<T> = Result<T, RuntimeError>;

/// Instance of a variable or class.
pub struct Instance {
    class: String,
    unit: Arc<Unit>,
    fields: Mutex<HashMap<String, Value>>,
}

impl Instance {
    fn new(class: &str, unit: Arc<Unit>) -> Self {
        let fields = unit
            .fields
            .iter()
            .map(|f| (f.name.clone(), Value::Null))
            .collect();
        Self {
            class: class.to_string(),
            unit,
            fields: Mutex::new(fields),
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    /// Current value of a declared field.
    pub fn field(&self, name: &str) -> Option<Value> {
        self.fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn set_field(&self, name: &str, value: Value) -> bool {
        if !self.unit.has_field(name) {
            return false;
        }
        self.fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value);
        true
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("class", &self.class)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Object(Arc<Instance>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Str(s) => !s.is_empty(),
            Value::Object(_) => true,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "integer",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
            Value::Object(inst) => write!(f, "<{}>", inst.class),
        }
    }
}

enum Flow {
    Normal,
    Return(Value),
}

/// Locals of one script or method body. Locals are function-scoped.
struct Frame {
    locals: HashMap<String, Value>,
    this: Option<Arc<Instance>>,
    depth: usize,
}

impl Frame {
    fn top() -> Self {
        Self {
            locals: HashMap::new(),
            this: None,
            depth: 0,
        }
    }

    fn method(this: Arc<Instance>, locals: HashMap<String, Value>, depth: usize) -> Self {
        Self {
            locals,
            this: Some(this),
            depth,
        }
    }
}

pub struct Interpreter {
    snapshot: Arc<Snapshot>,
    console: Arc<dyn Console>,
    max_call_depth: usize,
    globals: Mutex<HashMap<String, Arc<Instance>>>,
    active_frames: AtomicUsize,
}

/// Holds one slot of [`MAX_EVAL_DEPTH`] until dropped.
struct FrameSlot<'a>(&'a AtomicUsize);

impl Drop for FrameSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("generation", &self.snapshot.generation())
            .field("max_call_depth", &self.max_call_depth)
            .finish_non_exhaustive()
    }
}

impl Interpreter {
    /// `max_call_depth` is clamped to [`MAX_CALL_DEPTH`].
    pub fn new(snapshot: Arc<Snapshot>, console: Arc<dyn Console>, max_call_depth: usize) -> Self {
        Self {
            snapshot,
            console,
            max_call_depth: max_call_depth.min(MAX_CALL_DEPTH),
            globals: Mutex::new(HashMap::new()),
            active_frames: AtomicUsize::new(0),
        }
    }

    pub fn max_call_depth(&self) -> usize {
        self.max_call_depth
    }

    fn enter_frame(&self) -> EvalResult<FrameSlot<'_>> {
        let slot = FrameSlot(&self.active_frames);
        if self.active_frames.fetch_add(1, Ordering::Relaxed) >= MAX_EVAL_DEPTH {
            return Err(RuntimeError::fault(format!(
                "maximum evaluation depth of {MAX_EVAL_DEPTH} exceeded"
            )));
        }
        Ok(slot)
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    /// Execute `script` to completion. A top-level `return` ends the run
    /// successfully.
    pub async fn run(&self, script: &Script) -> EvalResult<()> {
        let mut frame = Frame::top();
        self.exec_block(&mut frame, &script.body).await.map(|_| ())
    }

    fn exec_block<'a>(
        &'a self,
        frame: &'a mut Frame,
        stmts: &'a [Stmt],
    ) -> BoxFuture<'a, EvalResult<Flow>> {
        async move {
            for stmt in stmts {
                let flow = self.exec(frame, stmt).await.map_err(|e| e.at(stmt.line))?;
                if let Flow::Return(value) = flow {
                    return Ok(Flow::Return(value));
                }
            }
            Ok(Flow::Normal)
        }
        .boxed()
    }

    fn exec<'a>(&'a self, frame: &'a mut Frame, stmt: &'a Stmt) -> BoxFuture<'a, EvalResult<Flow>> {
        async move {
            let _slot = self.enter_frame()?;
            match &stmt.kind {
                StmtKind::Let { name, value } => {
                    let value = self.eval(frame, value).await?;
                    frame.locals.insert(name.clone(), value);
                }
                StmtKind::Assign { target, value } => {
                    let value = self.eval(frame, value).await?;
                    match target {
                        AssignTarget::Ident(name) => assign_ident(frame, name, value),
                        AssignTarget::Property { target, name } => {
                            let object = self.eval(frame, target).await?;
                            self.set_property(frame.depth, object, name, value).await?;
                        }
                    }
                }
                StmtKind::Return(value) => {
                    let value = match value {
                        Some(expr) => self.eval(frame, expr).await?,
                        None => Value::Null,
                    };
                    return Ok(Flow::Return(value));
                }
                StmtKind::If {
                    cond,
                    then_branch,
                    else_branch,
                } => {
                    let branch = if self.eval(frame, cond).await?.is_truthy() {
                        then_branch
                    } else {
                        else_branch
                    };
                    return self.exec_block(frame, branch).await;
                }
                StmtKind::While { cond, body } => {
                    while self.eval(frame, cond).await?.is_truthy() {
                        if let Flow::Return(value) = self.exec_block(frame, body).await? {
                            return Ok(Flow::Return(value));
                        }
                        tokio::task::yield_now().await;
                    }
                }
                StmtKind::Expr(expr) => {
                    self.eval(frame, expr).await?;
                }
            }
            Ok(Flow::Normal)
        }
        .boxed()
    }

    fn eval<'a>(&'a self, frame: &'a mut Frame, expr: &'a Expr) -> BoxFuture<'a, EvalResult<Value>> {
        async move {
            let _slot = self.enter_frame()?;
            match expr {
                Expr::Str(s) => Ok(Value::Str(s.clone())),
                Expr::Int(n) => Ok(Value::Int(*n)),
                Expr::Bool(b) => Ok(Value::Bool(*b)),
                Expr::Null => Ok(Value::Null),
                Expr::Ident(name) => self.lookup(frame, name).await,
                Expr::Property { target, name } => {
                    let object = self.eval(frame, target).await?;
                    self.get_property(frame.depth, object, name).await
                }
                Expr::MethodCall {
                    target,
                    method,
                    args,
                } => {
                    let object = self.eval(frame, target).await?;
                    let args = self.eval_args(frame, args).await?;
                    self.invoke(frame.depth, object, method, args).await
                }
                Expr::Call { name, args } => {
                    let args = self.eval_args(frame, args).await?;
                    self.call(frame, name, args).await
                }
                Expr::New { class, args } => {
                    let args = self.eval_args(frame, args).await?;
                    self.instantiate(frame.depth, class, args).await
                }
                Expr::Unary { op, operand } => {
                    let value = self.eval(frame, operand).await?;
                    unary(*op, value)
                }
                Expr::Binary { op, left, right } => {
                    let left = self.eval(frame, left).await?;
                    match op {
                        BinaryOp::And if !left.is_truthy() => Ok(Value::Bool(false)),
                        BinaryOp::Or if left.is_truthy() => Ok(Value::Bool(true)),
                        BinaryOp::And | BinaryOp::Or => {
                            let right = self.eval(frame, right).await?;
                            Ok(Value::Bool(right.is_truthy()))
                        }
                        _ => {
                            let right = self.eval(frame, right).await?;
                            binary(*op, left, right)
                        }
                    }
                }
            }
        }
        .boxed()
    }

    async fn eval_args(&self, frame: &mut Frame, args: &[Expr]) -> EvalResult<Vec<Value>> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(frame, arg).await?);
        }
        Ok(values)
    }

    /// Locals, then fields of `this`, then global variables.
    async fn lookup(&self, frame: &Frame, name: &str) -> EvalResult<Value> {
        if let Some(value) = frame.locals.get(name) {
            return Ok(value.clone());
        }
        if let Some(this) = &frame.this {
            if this.unit.has_field(name) {
                return Ok(this.field(name).unwrap_or(Value::Null));
            }
        }
        if let Some(instance) = self.global(frame.depth, name).await? {
            return Ok(Value::Object(instance));
        }
        if self.snapshot.resolve_kind(name, SymbolKind::Class).is_some() {
            return Err(RuntimeError::fault(format!(
                "`{name}` is a class; use `new {name}(..)`"
            )));
        }
        Err(RuntimeError::fault(format!("unknown identifier `{name}`")))
    }

    /// Per-run singleton for global variable `name`, created on first use.
    fn global<'a>(
        &'a self,
        depth: usize,
        name: &'a str,
    ) -> BoxFuture<'a, EvalResult<Option<Arc<Instance>>>> {
        async move {
            if let Some(existing) = self.cached_global(name) {
                return Ok(Some(existing));
            }
            let Some(def) = self.snapshot.resolve_kind(name, SymbolKind::Variable) else {
                return Ok(None);
            };
            let instance = Arc::new(Instance::new(name, unit_of(def)?));
            self.globals
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.to_string(), instance.clone());
            self.init_fields(depth, &instance).await?;
            Ok(Some(instance))
        }
        .boxed()
    }

    fn cached_global(&self, name: &str) -> Option<Arc<Instance>> {
        self.globals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    async fn init_fields(&self, depth: usize, instance: &Arc<Instance>) -> EvalResult<()> {
        let unit = instance.unit.clone();
        for field in &unit.fields {
            let Some(init) = &field.init else { continue };
            let mut frame = Frame::method(instance.clone(), HashMap::new(), depth + 1);
            let value = self
                .eval(&mut frame, init)
                .await
                .map_err(|e| e.at(field.line))?;
            instance.set_field(&field.name, value);
        }
        Ok(())
    }

    async fn instantiate(&self, depth: usize, class: &str, args: Vec<Value>) -> EvalResult<Value> {
        let def = self
            .snapshot
            .resolve_kind(class, SymbolKind::Class)
            .ok_or_else(|| RuntimeError::fault(format!("unknown class `{class}`")))?;
        let instance = Arc::new(Instance::new(class, unit_of(def)?));
        self.init_fields(depth, &instance).await?;

        match instance.unit.method("init", args.len()).cloned() {
            Some(init) => {
                self.call_method(depth, instance.clone(), init, args).await?;
            }
            None if args.is_empty() => {}
            None => {
                return Err(RuntimeError::fault(format!(
                    "`{class}` has no init taking {} argument(s)",
                    args.len()
                )))
            }
        }
        Ok(Value::Object(instance))
    }

    /// Bare call `name(args)`: a method of `this`, then the `call` method of
    /// a global variable, then a builtin step.
    async fn call(&self, frame: &Frame, name: &str, args: Vec<Value>) -> EvalResult<Value> {
        if let Some(this) = &frame.this {
            if let Some(method) = this.unit.method(name, args.len()).cloned() {
                return self.call_method(frame.depth, this.clone(), method, args).await;
            }
        }
        if let Some(instance) = self.global(frame.depth, name).await? {
            let method = instance.unit.method("call", args.len()).cloned().ok_or_else(|| {
                RuntimeError::fault(format!(
                    "`{name}` has no call method taking {} argument(s)",
                    args.len()
                ))
            })?;
            return self.call_method(frame.depth, instance, method, args).await;
        }
        self.builtin(name, args).await
    }

    fn call_method<'a>(
        &'a self,
        depth: usize,
        this: Arc<Instance>,
        method: Arc<MethodDecl>,
        args: Vec<Value>,
    ) -> BoxFuture<'a, EvalResult<Value>> {
        async move {
            let _slot = self.enter_frame()?;
            let depth = depth + 1;
            if depth > self.max_call_depth {
                return Err(RuntimeError::fault(format!(
                    "maximum call depth of {} exceeded in `{}.{}`",
                    self.max_call_depth, this.class, method.name
                )));
            }
            let locals = method.params.iter().cloned().zip(args).collect();
            let mut frame = Frame::method(this, locals, depth);
            match self.exec_block(&mut frame, &method.body).await? {
                Flow::Return(value) => Ok(value),
                Flow::Normal => Ok(Value::Null),
            }
        }
        .boxed()
    }

    async fn invoke(
        &self,
        depth: usize,
        object: Value,
        method: &str,
        args: Vec<Value>,
    ) -> EvalResult<Value> {
        match object {
            Value::Object(instance) => {
                let decl = instance.unit.method(method, args.len()).cloned().ok_or_else(|| {
                    RuntimeError::fault(format!(
                        "`{}` has no method `{method}` taking {} argument(s)",
                        instance.class,
                        args.len()
                    ))
                })?;
                self.call_method(depth, instance, decl, args).await
            }
            Value::Str(s) => string_method(&s, method, &args),
            other => Err(RuntimeError::fault(format!(
                "cannot call `{method}` on {}",
                other.type_name()
            ))),
        }
    }

    /// `obj.p` calls `getP()` when defined, else reads field `p`.
    async fn get_property(&self, depth: usize, object: Value, name: &str) -> EvalResult<Value> {
        match object {
            Value::Object(instance) => {
                let getter = format!("get{}", capitalize(name));
                if let Some(method) = instance.unit.method(&getter, 0).cloned() {
                    return self.call_method(depth, instance, method, Vec::new()).await;
                }
                if instance.unit.has_field(name) {
                    return Ok(instance.field(name).unwrap_or(Value::Null));
                }
                Err(RuntimeError::fault(format!(
                    "`{}` has no property `{name}`",
                    instance.class
                )))
            }
            Value::Str(s) if name == "length" => Ok(Value::Int(s.chars().count() as i64)),
            other => Err(RuntimeError::fault(format!(
                "cannot read property `{name}` of {}",
                other.type_name()
            ))),
        }
    }

    /// `obj.p = v` calls `setP(v)` when defined, else writes declared field `p`.
    async fn set_property(
        &self,
        depth: usize,
        object: Value,
        name: &str,
        value: Value,
    ) -> EvalResult<()> {
        let instance = match object {
            Value::Object(instance) => instance,
            other => {
                return Err(RuntimeError::fault(format!(
                    "cannot set property `{name}` on {}",
                    other.type_name()
                )))
            }
        };
        let setter = format!("set{}", capitalize(name));
        if let Some(method) = instance.unit.method(&setter, 1).cloned() {
            self.call_method(depth, instance, method, vec![value]).await?;
            return Ok(());
        }
        if instance.set_field(name, value) {
            Ok(())
        } else {
            Err(RuntimeError::fault(format!(
                "`{}` has no property `{name}`",
                instance.class
            )))
        }
    }

    async fn builtin(&self, name: &str, args: Vec<Value>) -> EvalResult<Value> {
        match name {
            "echo" => {
                let line = args
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                self.console.echo(line);
                Ok(Value::Null)
            }
            "sleep" => match args.as_slice() {
                [Value::Int(seconds)] if *seconds >= 0 => {
                    tokio::time::sleep(Duration::from_secs(*seconds as u64)).await;
                    Ok(Value::Null)
                }
                _ => Err(RuntimeError::fault(
                    "sleep expects one non-negative integer of seconds",
                )),
            },
            "error" => {
                let message = args
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                Err(RuntimeError::Abort(message))
            }
            "libraryResource" => match args.as_slice() {
                [Value::Str(path)] => self
                    .snapshot
                    .resource(path)
                    .map(|text| Value::Str(text.to_string()))
                    .ok_or_else(|| RuntimeError::fault(format!("no library resource `{path}`"))),
                _ => Err(RuntimeError::fault("libraryResource expects one path")),
            },
            _ => Err(RuntimeError::fault(format!(
                "no step or method named `{name}`"
            ))),
        }
    }
}

/// Identifier assignment: an existing local, then a field of `this`,
/// otherwise a new local.
fn assign_ident(frame: &mut Frame, name: &str, value: Value) {
    if !frame.locals.contains_key(name) {
        if let Some(this) = &frame.this {
            if this.set_field(name, value.clone()) {
                return;
            }
        }
    }
    frame.locals.insert(name.to_string(), value);
}

fn unit_of(def: &LibraryDefinition) -> EvalResult<Arc<Unit>> {
    def.compiled.clone().downcast::<Unit>().map_err(|_| {
        RuntimeError::fault(format!(
            "`{}` was not compiled by the script engine",
            def.name
        ))
    })
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn unary(op: UnaryOp, value: Value) -> EvalResult<Value> {
    match (op, value) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.is_truthy())),
        (UnaryOp::Neg, Value::Int(n)) => n
            .checked_neg()
            .map(Value::Int)
            .ok_or_else(|| RuntimeError::fault("integer overflow")),
        (UnaryOp::Neg, other) => Err(RuntimeError::fault(format!(
            "cannot negate {}",
            other.type_name()
        ))),
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> EvalResult<Value> {
    use std::cmp::Ordering;

    if op == BinaryOp::Add && (matches!(left, Value::Str(_)) || matches!(right, Value::Str(_))) {
        return Ok(Value::Str(format!("{left}{right}")));
    }

    match op {
        BinaryOp::Eq => return Ok(Value::Bool(left == right)),
        BinaryOp::NotEq => return Ok(Value::Bool(left != right)),
        BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => {
            let ordering = match (&left, &right) {
                (Value::Int(a), Value::Int(b)) => a.cmp(b),
                (Value::Str(a), Value::Str(b)) => a.cmp(b),
                _ => {
                    return Err(RuntimeError::fault(format!(
                        "cannot compare {} with {}",
                        left.type_name(),
                        right.type_name()
                    )))
                }
            };
            let result = match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::LtEq => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    let (Value::Int(a), Value::Int(b)) = (&left, &right) else {
        return Err(RuntimeError::fault(format!(
            "unsupported operands {} and {}",
            left.type_name(),
            right.type_name()
        )));
    };
    let (a, b) = (*a, *b);
    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div | BinaryOp::Rem if b == 0 => {
            return Err(RuntimeError::fault("division by zero"))
        }
        BinaryOp::Div => a.checked_div(b),
        BinaryOp::Rem => a.checked_rem(b),
        _ => None,
    };
    result
        .map(Value::Int)
        .ok_or_else(|| RuntimeError::fault("integer overflow"))
}

fn string_method(s: &str, method: &str, args: &[Value]) -> EvalResult<Value> {
    match (method, args) {
        ("length", []) => Ok(Value::Int(s.chars().count() as i64)),
        ("toUpperCase", []) => Ok(Value::Str(s.to_uppercase())),
        ("toLowerCase", []) => Ok(Value::Str(s.to_lowercase())),
        ("trim", []) => Ok(Value::Str(s.trim().to_string())),
        ("contains", [needle]) => Ok(Value::Bool(s.contains(&needle.to_string()))),
        _ => Err(RuntimeError::fault(format!(
            "string has no method `{method}` taking {} argument(s)",
            args.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceLayout;
    use crate::registry::{CompiledHandle, LibraryCompiler, LibraryRegistry};
    use crate::script::{parse_script, parse_unit};
    use crate::workspace::{SourceSet, WorkspaceRoot};

    struct UnitCompiler;

    impl LibraryCompiler for UnitCompiler {
        fn compile(
            &self,
            _name: &str,
            _kind: SymbolKind,
            source: &str,
        ) -> Result<CompiledHandle, String> {
            parse_unit(source)
                .map(|unit| Arc::new(unit) as CompiledHandle)
                .map_err(|e| e.to_string())
        }
    }

    #[derive(Default)]
    struct Capture(Mutex<Vec<String>>);

    impl Console for Capture {
        fn echo(&self, line: String) {
            self.0.lock().unwrap().push(line);
        }
    }

    const ACME: &str = r#"
        field name = ""

        def setName(value) {
            name = value
        }

        def getName() {
            return name
        }

        def caution(message) {
            echo "Hello, " + name + "! CAUTION: " + message
        }

        def call(what) {
            echo "acme " + what
        }
    "#;

    const GREETING: &str = r#"
        field target
        field count = 0

        def init(who) {
            target = who
        }

        def greet() {
            count = count + 1
            return "hi " + target + " #" + count
        }

        def recurse(n) {
            return recurse(n + 1)
        }

        def nested(n) {
            if (true) {
                if (true) {
                    if (true) {
                        return nested(n + 1)
                    }
                }
            }
        }
    "#;

    fn snapshot() -> Arc<Snapshot> {
        let root = WorkspaceRoot::create(&WorkspaceLayout::default()).unwrap();
        root.stage_symbol(SourceSet::Variables, "acme", ACME).unwrap();
        root.stage_symbol(SourceSet::Classes, "Greeting", GREETING)
            .unwrap();
        root.stage(SourceSet::Resources, "org/acme/motd.txt", "be careful")
            .unwrap();
        LibraryRegistry::new().rebuild(&root, &UnitCompiler).unwrap()
    }

    async fn run(source: &str) -> (EvalResult<()>, Vec<String>) {
        let console = Arc::new(Capture::default());
        let interpreter = Interpreter::new(snapshot(), console.clone(), 50);
        let result = interpreter.run(&parse_script(source).unwrap()).await;
        let lines = console.0.lock().unwrap().clone();
        (result, lines)
    }

    #[tokio::test]
    async fn test_setter_getter_and_method() {
        let (result, lines) = run(
            "acme.name = 'acmeName'\necho acme.name\nacme.caution('wet floor')",
        )
        .await;
        result.unwrap();
        assert_eq!(
            lines,
            vec!["acmeName", "Hello, acmeName! CAUTION: wet floor"]
        );
    }

    #[tokio::test]
    async fn test_variable_call_method() {
        let (result, lines) = run("acme 'tools'").await;
        result.unwrap();
        assert_eq!(lines, vec!["acme tools"]);
    }

    #[tokio::test]
    async fn test_class_instances_are_independent() {
        let (result, lines) = run(
            "let a = new Greeting('ann')\nlet b = new Greeting('bob')\na.greet()\necho a.greet()\necho b.greet()",
        )
        .await;
        result.unwrap();
        assert_eq!(lines, vec!["hi ann #2", "hi bob #1"]);
    }

    #[tokio::test]
    async fn test_error_step_aborts() {
        let (result, lines) = run("echo 'before'\nerror 'boom'\necho 'after'").await;
        assert_eq!(result, Err(RuntimeError::Abort("boom".to_string())));
        assert_eq!(lines, vec!["before"]);
    }

    #[tokio::test]
    async fn test_unknown_identifier_reports_line() {
        let (result, _) = run("echo 'ok'\n\necho nothing").await;
        match result {
            Err(RuntimeError::Fault { line, message }) => {
                assert_eq!(line, 3);
                assert!(message.contains("nothing"), "{message}");
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_depth_limited() {
        let (result, _) = run("new Greeting('x').recurse(0)").await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("maximum call depth"), "{err}");
    }

    #[tokio::test]
    async fn test_evaluation_depth_limited() {
        let (result, _) = run("new Greeting('x').nested(0)").await;
        let err = result.unwrap_err();
        assert!(
            err.to_string().contains("maximum evaluation depth"),
            "{err}"
        );
    }

    #[test]
    fn test_call_depth_clamped() {
        let interpreter = Interpreter::new(snapshot(), Arc::new(Capture::default()), 10_000);
        assert_eq!(interpreter.max_call_depth(), MAX_CALL_DEPTH);
    }

    #[tokio::test]
    async fn test_frames_released_after_fault() {
        let console = Arc::new(Capture::default());
        let interpreter = Interpreter::new(snapshot(), console.clone(), 8);
        let first = interpreter
            .run(&parse_script("new Greeting('x').recurse(0)").unwrap())
            .await;
        assert!(first.unwrap_err().to_string().contains("maximum call depth"));
        assert_eq!(interpreter.active_frames.load(Ordering::Relaxed), 0);

        interpreter
            .run(&parse_script("echo new Greeting('y').greet()").unwrap())
            .await
            .unwrap();
        assert_eq!(console.0.lock().unwrap().clone(), vec!["hi y #1"]);
    }

    #[tokio::test]
    async fn test_loops_arithmetic_and_strings() {
        let (result, lines) = run(
            "let i = 0\nlet total = 0\nwhile (i < 5) { i = i + 1; total = total + i * 2 }\necho total, 'done'.toUpperCase(), 7 % 3, -i",
        )
        .await;
        result.unwrap();
        assert_eq!(lines, vec!["30 DONE 1 -5"]);
    }

    #[tokio::test]
    async fn test_division_by_zero_faults() {
        let (result, _) = run("let x = 1 / 0").await;
        assert!(result.unwrap_err().to_string().contains("division by zero"));
    }

    #[tokio::test]
    async fn test_library_resource() {
        let (result, lines) = run("echo libraryResource('org/acme/motd.txt')").await;
        result.unwrap();
        assert_eq!(lines, vec!["be careful"]);

        let (result, _) = run("libraryResource('missing.txt')").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_short_circuit_and_branches() {
        let (result, lines) = run(
            "if (false && nothing) { echo 'no' } else if (true || nothing) { echo 'yes' } else { echo 'never' }",
        )
        .await;
        result.unwrap();
        assert_eq!(lines, vec!["yes"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_suspends() {
        let started = tokio::time::Instant::now();
        let (result, _) = run("sleep 3").await;
        result.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("name"), "Name");
        assert_eq!(capitalize(""), "");
    }
}
