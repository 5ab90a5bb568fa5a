//! 步骤间引用解析
//!
//! 语法 `{{stepN.path}}`，N 从 1 开始；`stepN.result.x`、`stepN.data.x` 与 `stepN.x` 都指向第 N 步结果的 data。
//! 路径段支持 `key`、`key[2]`、纯数字段（数组下标）。
//!
//! 解析失败（键缺失、下标越界、引用当前或之后的步骤）一律替换为 UNRESOLVED_MARKER，不报错也不留空；
//! 派发前由 `find_unresolved` 递归扫描，发现标记即交给反思。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::core::StepResult;

/// 无法解析的引用被替换成的哨兵值
pub const UNRESOLVED_MARKER: &str = "__UNRESOLVED_REFERENCE__";

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*step(\d+)((?:\.[^}\s]+)?)\s*\}\}").expect("placeholder regex")
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Option<Vec<Segment>> {
    let mut out = Vec::new();
    for part in path.split('.').filter(|p| !p.is_empty()) {
        let (key, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            match key.parse::<usize>() {
                Ok(i) => out.push(Segment::Index(i)),
                Err(_) => out.push(Segment::Key(key.to_string())),
            }
        }
        while !rest.is_empty() {
            let close = rest.find(']')?;
            let idx = rest.get(1..close)?.trim().parse::<usize>().ok()?;
            out.push(Segment::Index(idx));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return None;
            }
        }
    }
    Some(out)
}

fn walk<'a>(mut v: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    for seg in segments {
        v = match (seg, v) {
            (Segment::Key(k), Value::Object(m)) => m.get(k)?,
            (Segment::Index(i), Value::Array(a)) => a.get(*i)?,
            (Segment::Index(i), Value::Object(m)) => m.get(&i.to_string())?,
            _ => return None,
        };
    }
    Some(v)
}

/// 在第 N 步的结果中按路径取值
fn lookup(result: &StepResult, path: &str) -> Option<Value> {
    let mut segments = parse_path(path)?;
    if matches!(segments.first(), Some(Segment::Key(k)) if k == "result" || k == "data") {
        segments.remove(0);
    }
    if let Some(data) = &result.data {
        if let Some(v) = walk(data, &segments) {
            return Some(v.clone());
        }
    }
    // data 中没有时允许取结果本身的字段（message / success / images）
    match segments.first() {
        Some(Segment::Key(k)) if matches!(k.as_str(), "message" | "success" | "images") => {
            let whole = serde_json::to_value(result).ok()?;
            walk(&whole, &segments).cloned()
        }
        _ => None,
    }
}

fn resolve_one(
    step_no: &str,
    path: &str,
    prior: &[StepResult],
    current_index: usize,
) -> Option<Value> {
    let n: usize = step_no.parse().ok()?;
    if n == 0 || n - 1 >= current_index {
        return None;
    }
    lookup(prior.get(n - 1)?, path.trim_start_matches('.'))
}

fn value_to_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn substitute_str(
    s: &str,
    prior: &[StepResult],
    current_index: usize,
    unresolved: &mut Vec<String>,
) -> Value {
    let re = placeholder_re();
    // 整个字符串就是一个引用：保留原 JSON 类型
    if let Some(caps) = re.captures(s) {
        if let Some(m) = caps.get(0) {
            if m.start() == 0 && m.end() == s.len() {
                let path = caps.get(2).map_or("", |p| p.as_str());
                return match resolve_one(&caps[1], path, prior, current_index) {
                    Some(v) => v,
                    None => {
                        unresolved.push(s.to_string());
                        Value::String(UNRESOLVED_MARKER.to_string())
                    }
                };
            }
        }
    } else {
        return Value::String(s.to_string());
    }

    let replaced = re.replace_all(s, |caps: &regex::Captures| {
        let path = caps.get(2).map_or("", |p| p.as_str());
        match resolve_one(&caps[1], path, prior, current_index) {
            Some(v) => value_to_text(&v),
            None => {
                unresolved.push(caps[0].to_string());
                UNRESOLVED_MARKER.to_string()
            }
        }
    });
    Value::String(replaced.into_owned())
}

fn substitute_value(
    v: &Value,
    prior: &[StepResult],
    current_index: usize,
    unresolved: &mut Vec<String>,
) -> Value {
    match v {
        Value::String(s) => substitute_str(s, prior, current_index, unresolved),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|i| substitute_value(i, prior, current_index, unresolved))
                .collect(),
        ),
        Value::Object(m) => Value::Object(
            m.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, prior, current_index, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// 替换 params 中的所有引用。`current_index` 为当前步骤的 0 基下标，`prior` 为之前各步的结果。
/// 返回替换后的参数与未能解析的原始引用文本
pub fn resolve_params(
    params: &Map<String, Value>,
    prior: &[StepResult],
    current_index: usize,
) -> (Map<String, Value>, Vec<String>) {
    let mut unresolved = Vec::new();
    let resolved = params
        .iter()
        .map(|(k, v)| (k.clone(), substitute_value(v, prior, current_index, &mut unresolved)))
        .collect();
    (resolved, unresolved)
}

/// 递归查找含 UNRESOLVED_MARKER 的参数，返回其 JSON 路径
pub fn find_unresolved(params: &Map<String, Value>) -> Vec<String> {
    fn scan(v: &Value, path: String, out: &mut Vec<String>) {
        match v {
            Value::String(s) if s.contains(UNRESOLVED_MARKER) => out.push(path),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    scan(item, format!("{path}[{i}]"), out);
                }
            }
            Value::Object(m) => {
                for (k, v) in m {
                    scan(v, format!("{path}.{k}"), out);
                }
            }
            _ => {}
        }
    }
    let mut out = Vec::new();
    for (k, v) in params {
        scan(v, k.clone(), &mut out);
    }
    out
}

/// 参数里是否出现引用语法
pub fn has_placeholders(params: &Map<String, Value>) -> bool {
    fn any(v: &Value) -> bool {
        match v {
            Value::String(s) => placeholder_re().is_match(s),
            Value::Array(items) => items.iter().any(any),
            Value::Object(m) => m.values().any(any),
            _ => false,
        }
    }
    params.values().any(any)
}

/// 提取引用到的步骤编号（1 基），供计划校验
pub fn referenced_steps(params: &Map<String, Value>) -> Vec<usize> {
    fn collect(v: &Value, out: &mut Vec<usize>) {
        match v {
            Value::String(s) => {
                for caps in placeholder_re().captures_iter(s) {
                    if let Ok(n) = caps[1].parse() {
                        out.push(n);
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|i| collect(i, out)),
            Value::Object(m) => m.values().for_each(|i| collect(i, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    params.values().for_each(|v| collect(v, &mut out));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    fn emails() -> Vec<StepResult> {
        vec![StepResult::ok_with_data(
            "fetched",
            json!({"emails": [{"subject": "hi"}, {"subject": "Quarterly report", "id": 7}], "count": 2}),
        )]
    }

    #[test]
    fn test_nested_index_and_type_preserved() {
        let (p, missing) = resolve_params(
            &params(json!({
                "subject": "{{step1.result.emails[1].subject}}",
                "id": "{{step1.emails.1.id}}",
                "line": "Got {{step1.count}} mails"
            })),
            &emails(),
            1,
        );
        assert!(missing.is_empty());
        assert_eq!(p["subject"], "Quarterly report");
        assert_eq!(p["id"], 7);
        assert_eq!(p["line"], "Got 2 mails");
    }

    #[test]
    fn test_missing_key_yields_marker_not_empty() {
        let prior = vec![StepResult::ok_with_data("created", json!({"name": "x"}))];
        let (p, missing) = resolve_params(&params(json!({"target": "{{step1.result.id}}"})), &prior, 1);
        assert_eq!(p["target"], UNRESOLVED_MARKER);
        assert_eq!(missing, vec!["{{step1.result.id}}".to_string()]);
        assert_eq!(find_unresolved(&p), vec!["target".to_string()]);
    }

    #[test]
    fn test_out_of_range_and_forward_refs() {
        let (p, missing) = resolve_params(
            &params(json!({
                "a": "{{step1.emails[9].subject}}",
                "b": {"nested": ["{{step2.id}}"]},
                "c": "x {{step0}}"
            })),
            &emails(),
            1,
        );
        assert_eq!(missing.len(), 3);
        let mut paths = find_unresolved(&p);
        paths.sort();
        assert_eq!(paths, vec!["a", "b.nested[0]", "c"]);
    }

    #[test]
    fn test_result_fields_fallback() {
        let (p, _) = resolve_params(&params(json!({"m": "{{step1.message}}"})), &emails(), 1);
        assert_eq!(p["m"], "fetched");
    }

    #[test]
    fn test_plain_strings_untouched() {
        let input = params(json!({"text": "{ not a placeholder }", "n": 3}));
        let (p, missing) = resolve_params(&input, &[], 0);
        assert_eq!(p, input);
        assert!(missing.is_empty());
        assert!(!has_placeholders(&input));
    }

    #[test]
    fn test_referenced_steps() {
        let p = params(json!({"a": "{{step1.x}} and {{step3.y}}", "b": ["{{step2}}"]}));
        let mut refs = referenced_steps(&p);
        refs.sort();
        assert_eq!(refs, vec![1, 2, 3]);
    }
}
