//! 生成脚本静态审计
//!
//! 用 tree-sitter-python 把脚本解析成语法树后逐节点检查（不做文本 / 正则匹配）：
//! - 导入系统级模块（os、subprocess、ctypes …）
//! - 绕过静态分析的内省与动态执行（`__subclasses__`、`getattr(__builtins__, "eval")`、eval / exec / `__import__`）
//! - 直接启动进程（system / popen / Popen …）
//! - open() 读写沙箱与主目录之外的字面量绝对路径
//!
//! 必须在脚本执行之前调用；拒绝时由脚本执行器报告为步骤失败（可经反思用修正脚本重试）。

use tree_sitter::{Node, Parser};

use crate::tools::filesystem::PathGuard;

const DENIED_MODULES: &[&str] = &[
    "os",
    "subprocess",
    "shutil",
    "sys",
    "platform",
    "ctypes",
    "multiprocessing",
    "threading",
    "importlib",
    "imp",
    "pkgutil",
    "builtins",
    "__builtin__",
    "pty",
    "socket",
    "signal",
    "commands",
];

const FORBIDDEN_ATTRIBUTES: &[&str] = &[
    "__subclasses__",
    "__bases__",
    "__base__",
    "__mro__",
    "__globals__",
    "__builtins__",
    "__code__",
    "__dict__",
    "__class__",
    "__getattribute__",
    "__loader__",
    "__spec__",
    "__import__",
    "func_globals",
    "f_globals",
    "f_locals",
    "f_back",
    "gi_frame",
];

const FORBIDDEN_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "input",
    "breakpoint",
    "globals",
    "locals",
    "vars",
];

const REFLECTIVE_CALLS: &[&str] = &["getattr", "setattr", "delattr", "hasattr"];

const BUILTIN_OBJECTS: &[&str] = &["__builtins__", "builtins", "__builtin__"];

const PROCESS_CALLS: &[&str] = &[
    "system",
    "popen",
    "startfile",
    "execv",
    "execve",
    "execl",
    "execle",
    "execlp",
    "execvp",
    "execvpe",
    "spawnl",
    "spawnv",
    "spawnve",
    "posix_spawn",
    "fork",
    "forkpty",
    "Popen",
    "check_output",
    "check_call",
    "getoutput",
    "getstatusoutput",
    "import_module",
];

/// 标识符是否处在调用目标、`obj.name` 的成员名或关键字参数名的位置
fn is_call_or_member_name(node: Node) -> bool {
    let Some(parent) = node.parent() else { return false };
    let field = match parent.kind() {
        "call" => "function",
        "attribute" => "attribute",
        "keyword_argument" => "name",
        _ => return false,
    };
    parent.child_by_field_name(field) == Some(node)
}

/// 审计结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditVerdict {
    pub is_safe: bool,
    pub reason: String,
    pub violations: Vec<String>,
}

impl AuditVerdict {
    fn safe(reason: &str) -> Self {
        Self {
            is_safe: true,
            reason: reason.to_string(),
            violations: Vec::new(),
        }
    }
}

/// 安全审计器；可选绑定 PathGuard 以检查 open() 的字面量路径
#[derive(Debug, Clone, Default)]
pub struct SecurityAuditor {
    paths: Option<PathGuard>,
}

impl SecurityAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path_guard(mut self, guard: PathGuard) -> Self {
        self.paths = Some(guard);
        self
    }

    pub fn audit(&self, source: &str) -> AuditVerdict {
        let mut parser = Parser::new();
        if parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .is_err()
        {
            return AuditVerdict {
                is_safe: false,
                reason: "Python grammar unavailable; refusing to run unaudited code".to_string(),
                violations: Vec::new(),
            };
        }
        let tree = match parser.parse(source, None) {
            Some(t) => t,
            None => {
                return AuditVerdict {
                    is_safe: false,
                    reason: "Parser returned no tree".to_string(),
                    violations: Vec::new(),
                }
            }
        };

        let root = tree.root_node();
        let mut violations = Vec::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            self.check_node(node, source, &mut violations);
            for i in 0..node.named_child_count() {
                if let Some(child) = node.named_child(i) {
                    stack.push(child);
                }
            }
        }

        if violations.is_empty() {
            if root.has_error() {
                // 语法错误交给解释器报告
                return AuditVerdict::safe("No violations found (source has syntax errors)");
            }
            return AuditVerdict::safe("No violations found");
        }
        violations.dedup();
        AuditVerdict {
            is_safe: false,
            reason: violations.join("; "),
            violations,
        }
    }

    fn check_node(&self, node: Node, src: &str, out: &mut Vec<String>) {
        match node.kind() {
            "import_statement" => {
                for i in 0..node.named_child_count() {
                    let Some(child) = node.named_child(i) else { continue };
                    let name_node = if child.kind() == "aliased_import" {
                        child.child_by_field_name("name")
                    } else {
                        Some(child)
                    };
                    if let Some(n) = name_node {
                        check_module(text(n, src), out);
                    }
                }
            }
            "import_from_statement" => {
                if let Some(m) = node.child_by_field_name("module_name") {
                    if m.kind() == "dotted_name" {
                        check_module(text(m, src), out);
                    }
                }
            }
            "call" => self.check_call(node, src, out),
            "attribute" => {
                if let Some(attr) = node.child_by_field_name("attribute") {
                    let name = text(attr, src);
                    if FORBIDDEN_ATTRIBUTES.contains(&name) {
                        out.push(format!("introspection attribute '{name}'"));
                    }
                }
            }
            "identifier" => {
                let name = text(node, src);
                if name == "__builtins__" || name == "__loader__" {
                    out.push(format!("direct reference to '{name}'"));
                } else if FORBIDDEN_CALLS.contains(&name) && !is_call_or_member_name(node) {
                    // `f = exec; f(...)`、`run(eval)` 之类的别名
                    out.push(format!("reference to '{name}' outside a direct call"));
                }
            }
            _ => {}
        }
    }

    fn check_call(&self, node: Node, src: &str, out: &mut Vec<String>) {
        let Some(func) = node.child_by_field_name("function") else { return };
        let args = node.child_by_field_name("arguments");
        let arg = |i: usize| args.and_then(|a| a.named_child(i));

        match func.kind() {
            "identifier" => {
                let name = text(func, src);
                if name == "__import__" {
                    match arg(0).and_then(|a| string_literal(a, src)) {
                        Some(module) => out.push(format!("dynamic import of '{module}'")),
                        None => out.push("dynamic import via __import__".to_string()),
                    }
                } else if FORBIDDEN_CALLS.contains(&name) {
                    out.push(format!("dynamic execution call '{name}()'"));
                } else if REFLECTIVE_CALLS.contains(&name) {
                    let target = arg(0).map(|a| text(a, src)).unwrap_or_default();
                    let attr = arg(1).and_then(|a| string_literal(a, src));
                    if BUILTIN_OBJECTS.contains(&target) {
                        out.push(format!("{name}() on builtins"));
                    } else if let Some(attr) = attr {
                        if FORBIDDEN_ATTRIBUTES.contains(&attr.as_str())
                            || FORBIDDEN_CALLS.contains(&attr.as_str())
                            || PROCESS_CALLS.contains(&attr.as_str())
                        {
                            out.push(format!("{name}() fetching '{attr}' by name"));
                        }
                    } else if arg(1).is_some() {
                        out.push(format!("{name}() with a non-literal attribute name"));
                    }
                } else if name == "open" {
                    if let (Some(guard), Some(path)) =
                        (&self.paths, arg(0).and_then(|a| string_literal(a, src)))
                    {
                        if (path.starts_with('/') || path.starts_with('~'))
                            && guard.resolve(&path).is_err()
                        {
                            out.push(format!("open() outside allowed directories: {path}"));
                        }
                    }
                }
            }
            "attribute" => {
                if let Some(attr) = func.child_by_field_name("attribute") {
                    let name = text(attr, src);
                    if PROCESS_CALLS.contains(&name) {
                        out.push(format!("process invocation '{}'", text(func, src)));
                    }
                    let object = func
                        .child_by_field_name("object")
                        .map(|o| text(o, src))
                        .unwrap_or_default();
                    if object == "subprocess" && (name == "run" || name == "call") {
                        out.push(format!("process invocation 'subprocess.{name}'"));
                    }
                }
            }
            _ => {}
        }
    }
}

fn text<'a>(node: Node, src: &'a str) -> &'a str {
    node.utf8_text(src.as_bytes()).unwrap_or("")
}

/// 取字面量字符串内容；含插值（f-string）时返回 None
fn string_literal(node: Node, src: &str) -> Option<String> {
    if node.kind() != "string" {
        return None;
    }
    let mut content = String::new();
    for i in 0..node.named_child_count() {
        let child = node.named_child(i)?;
        match child.kind() {
            "interpolation" => return None,
            "string_content" => content.push_str(text(child, src)),
            _ => {}
        }
    }
    Some(content)
}

fn check_module(module: &str, out: &mut Vec<String>) {
    let top = module.split('.').next().unwrap_or(module).trim();
    if DENIED_MODULES.contains(&top) {
        out.push(format!("import of denied module '{top}'"));
    }
}
