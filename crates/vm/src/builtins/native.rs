//! Natively implemented builtins
//!
//! These run directly over [`Value`]s with no AST conversion and no registry
//! lookup. A builtin that cannot produce a value returns `Ok(None)`; the
//! call is undefined, not an error. Type predicates follow the same rule:
//! `is_string(1)` is undefined rather than false, so a failed test stops the
//! enclosing block.

use super::BuiltinError;
use crate::state::Globals;
use verdict_core::{Array, Number, Object, Set, Value};

type NativeResult = Result<Option<Value>, BuiltinError>;

/// Fast-path dispatch. `None` means the name is not native and the caller
/// should consult the host registry. Any undefined argument makes the call
/// undefined without invoking the implementation.
pub(crate) fn dispatch(g: &Globals, name: &str, args: &[Option<Value>]) -> Option<NativeResult> {
    let f: fn(&Globals, &[Value]) -> NativeResult = match name {
        "count" => count,
        "concat" => concat,
        "startswith" => startswith,
        "endswith" => endswith,
        "sprintf" => sprintf,
        "member" => member,
        "object.get" => object_get,
        "object.keys" => object_keys,
        "object.remove" => object_remove,
        "object.filter" => object_filter,
        "object.union" => object_union,
        "array.concat" => array_concat,
        "walk" => walk,
        "is_null" => |_, a| type_test(a, |v| matches!(v, Value::Null)),
        "is_boolean" => |_, a| type_test(a, |v| matches!(v, Value::Bool(_))),
        "is_number" => |_, a| type_test(a, |v| matches!(v, Value::Number(_))),
        "is_string" => |_, a| type_test(a, |v| matches!(v, Value::String(_))),
        "is_array" => |_, a| type_test(a, |v| matches!(v, Value::Array(_))),
        "is_object" => |_, a| type_test(a, |v| matches!(v, Value::Object(_))),
        "is_set" => |_, a| type_test(a, |v| matches!(v, Value::Set(_))),
        "type_name" => type_name,
        "json.unmarshal" => json_unmarshal,
        "json.marshal" => json_marshal,
        "numbers.range" => numbers_range,
        "glob.match" => glob_match,
        "print" => print,
        _ => return None,
    };
    let mut vals = Vec::with_capacity(args.len());
    for a in args {
        match a {
            Some(v) => vals.push(v.clone()),
            None => return Some(Ok(None)),
        }
    }
    Some(f(g, &vals))
}

fn arity(name: &str, args: &[Value], n: usize) -> Result<(), BuiltinError> {
    if args.len() == n {
        Ok(())
    } else {
        Err(BuiltinError::msg(format!(
            "{name}: expected {n} arguments, got {}",
            args.len()
        )))
    }
}

fn count(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("count", args, 1)?;
    match args[0].length() {
        Some(n) => Ok(Some(Value::int(n as i64))),
        None => Err(BuiltinError::msg(format!(
            "count: expected collection or string, got {}",
            args[0].type_name()
        ))),
    }
}

fn concat(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("concat", args, 2)?;
    let delim = args[0]
        .as_str()
        .ok_or_else(|| BuiltinError::msg("concat: delimiter must be a string"))?;
    let mut parts = Vec::new();
    let collect = |parts: &mut Vec<String>, v: &Value| -> Result<(), BuiltinError> {
        match v.as_str() {
            Some(s) => {
                parts.push(s.to_string());
                Ok(())
            }
            None => Err(BuiltinError::msg(format!(
                "concat: expected string element, got {}",
                v.type_name()
            ))),
        }
    };
    match &args[1] {
        Value::Array(a) => {
            for v in a.iter() {
                collect(&mut parts, v)?;
            }
        }
        Value::Set(s) => {
            for v in s.iter() {
                collect(&mut parts, v)?;
            }
        }
        other => {
            return Err(BuiltinError::msg(format!(
                "concat: expected array or set, got {}",
                other.type_name()
            )));
        }
    }
    Ok(Some(Value::string(parts.join(delim))))
}

fn startswith(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("startswith", args, 2)?;
    match (args[0].as_str(), args[1].as_str()) {
        (Some(s), Some(prefix)) => Ok(Some(Value::Bool(s.starts_with(prefix)))),
        _ => Err(BuiltinError::msg("startswith: expected string arguments")),
    }
}

fn endswith(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("endswith", args, 2)?;
    match (args[0].as_str(), args[1].as_str()) {
        (Some(s), Some(suffix)) => Ok(Some(Value::Bool(s.ends_with(suffix)))),
        _ => Err(BuiltinError::msg("endswith: expected string arguments")),
    }
}

/// Go-flavored formatting: `%v` any value, `%s` string, `%d` integer,
/// `%f` float, `%%` literal percent.
fn sprintf(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("sprintf", args, 2)?;
    let fmt = args[0]
        .as_str()
        .ok_or_else(|| BuiltinError::msg("sprintf: format must be a string"))?;
    let fmt_args = match &args[1] {
        Value::Array(a) => a,
        other => {
            return Err(BuiltinError::msg(format!(
                "sprintf: expected argument array, got {}",
                other.type_name()
            )));
        }
    };

    let mut out = String::with_capacity(fmt.len());
    let mut next = 0usize;
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let Some(verb) = chars.next() else {
            return Err(BuiltinError::msg("sprintf: trailing %"));
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        let arg = fmt_args
            .get(next)
            .ok_or_else(|| BuiltinError::msg("sprintf: not enough arguments"))?;
        next += 1;
        match verb {
            'v' => out.push_str(&render(arg)),
            's' => match arg.as_str() {
                Some(s) => out.push_str(s),
                None => out.push_str(&render(arg)),
            },
            'd' => match arg.as_number().and_then(Number::as_i64) {
                Some(n) => out.push_str(&n.to_string()),
                None => {
                    return Err(BuiltinError::msg(format!(
                        "sprintf: %d needs an integer, got {}",
                        arg.type_name()
                    )));
                }
            },
            'f' => match arg.as_number() {
                Some(n) => out.push_str(&format!("{:.6}", n.as_f64())),
                None => {
                    return Err(BuiltinError::msg(format!(
                        "sprintf: %f needs a number, got {}",
                        arg.type_name()
                    )));
                }
            },
            other => {
                return Err(BuiltinError::msg(format!("sprintf: unsupported verb %{other}")));
            }
        }
    }
    Ok(Some(Value::string(out)))
}

fn member(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("member", args, 2)?;
    let found = match &args[1] {
        Value::Array(a) => a.iter().any(|v| v == &args[0]),
        Value::Set(s) => s.contains(&args[0]),
        Value::Object(o) => o.iter().any(|(_, v)| v == &args[0]),
        _ => false,
    };
    Ok(Some(Value::Bool(found)))
}

fn object_get(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("object.get", args, 3)?;
    let Value::Object(obj) = &args[0] else {
        return Err(BuiltinError::msg(format!(
            "object.get: expected object, got {}",
            args[0].type_name()
        )));
    };
    // An array key is a path into nested objects.
    let found = match &args[1] {
        Value::Array(path) => {
            let mut cur = Some(&args[0]);
            for seg in path.iter() {
                cur = match cur {
                    Some(Value::Object(o)) => o.get(seg),
                    _ => None,
                };
            }
            if path.is_empty() { Some(&args[0]) } else { cur }
        }
        key => obj.get(key),
    };
    Ok(Some(found.unwrap_or(&args[2]).clone()))
}

fn object_keys(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("object.keys", args, 1)?;
    match &args[0] {
        Value::Object(o) => {
            let keys: Set = o.iter().map(|(k, _)| k.clone()).collect();
            Ok(Some(Value::Set(keys)))
        }
        other => Err(BuiltinError::msg(format!(
            "object.keys: expected object, got {}",
            other.type_name()
        ))),
    }
}

fn key_list(name: &str, v: &Value) -> Result<Vec<Value>, BuiltinError> {
    match v {
        Value::Array(a) => Ok(a.iter().cloned().collect()),
        Value::Set(s) => Ok(s.iter().cloned().collect()),
        Value::Object(o) => Ok(o.iter().map(|(k, _)| k.clone()).collect()),
        other => Err(BuiltinError::msg(format!(
            "{name}: expected array, set, or object of keys, got {}",
            other.type_name()
        ))),
    }
}

fn object_remove(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("object.remove", args, 2)?;
    let Value::Object(obj) = &args[0] else {
        return Err(BuiltinError::msg(format!(
            "object.remove: expected object, got {}",
            args[0].type_name()
        )));
    };
    let mut out = obj.clone();
    for k in key_list("object.remove", &args[1])? {
        out.remove(&k);
    }
    Ok(Some(Value::Object(out)))
}

fn object_filter(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("object.filter", args, 2)?;
    let Value::Object(obj) = &args[0] else {
        return Err(BuiltinError::msg(format!(
            "object.filter: expected object, got {}",
            args[0].type_name()
        )));
    };
    let mut out = Object::new();
    for k in key_list("object.filter", &args[1])? {
        if let Some(v) = obj.get(&k) {
            out.insert(k, v.clone());
        }
    }
    Ok(Some(Value::Object(out)))
}

fn object_union(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("object.union", args, 2)?;
    match (&args[0], &args[1]) {
        (Value::Object(a), Value::Object(b)) => Ok(Some(Value::Object(a.merge(b)))),
        _ => Err(BuiltinError::msg("object.union: expected two objects")),
    }
}

fn array_concat(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("array.concat", args, 2)?;
    match (&args[0], &args[1]) {
        (Value::Array(a), Value::Array(b)) => {
            Ok(Some(Value::Array(a.iter().chain(b.iter()).cloned().collect())))
        }
        _ => Err(BuiltinError::msg("array.concat: expected two arrays")),
    }
}

/// Relational: yields a `[path, node]` pair for every node reachable from
/// the argument, the argument itself included under the empty path.
fn walk(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("walk", args, 1)?;
    let mut out = Array::new();
    let mut path = Vec::new();
    walk_rec(&args[0], &mut path, &mut out);
    Ok(Some(Value::Array(out)))
}

fn walk_rec(v: &Value, path: &mut Vec<Value>, out: &mut Array) {
    out.push(Value::Array(
        vec![Value::Array(path.clone().into()), v.clone()].into(),
    ));
    match v {
        Value::Array(a) => {
            for (i, elem) in a.iter().enumerate() {
                path.push(Value::int(i as i64));
                walk_rec(elem, path, out);
                path.pop();
            }
        }
        Value::Object(o) => {
            for (k, val) in o.iter() {
                path.push(k.clone());
                walk_rec(val, path, out);
                path.pop();
            }
        }
        Value::Set(s) => {
            for elem in s.iter() {
                path.push(elem.clone());
                walk_rec(elem, path, out);
                path.pop();
            }
        }
        _ => {}
    }
}

fn type_test(args: &[Value], pred: impl Fn(&Value) -> bool) -> NativeResult {
    if args.len() != 1 {
        return Err(BuiltinError::msg("type test: expected 1 argument"));
    }
    // A failed test is undefined, not false.
    Ok(pred(&args[0]).then_some(Value::Bool(true)))
}

fn type_name(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("type_name", args, 1)?;
    Ok(Some(Value::string(args[0].type_name())))
}

fn json_unmarshal(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("json.unmarshal", args, 1)?;
    let raw = args[0]
        .as_str()
        .ok_or_else(|| BuiltinError::msg("json.unmarshal: expected a string"))?;
    let parsed: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| BuiltinError::msg(format!("json.unmarshal: {e}")))?;
    Ok(Some(Value::from_json(&parsed)))
}

fn json_marshal(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("json.marshal", args, 1)?;
    let rendered = serde_json::to_string(&args[0].to_json())
        .map_err(|e| BuiltinError::msg(format!("json.marshal: {e}")))?;
    Ok(Some(Value::string(rendered)))
}

fn numbers_range(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("numbers.range", args, 2)?;
    let (Some(a), Some(b)) = (
        args[0].as_number().and_then(Number::as_i64),
        args[1].as_number().and_then(Number::as_i64),
    ) else {
        return Err(BuiltinError::msg("numbers.range: expected integer bounds"));
    };
    let range: Vec<Value> = if a <= b {
        (a..=b).map(Value::int).collect()
    } else {
        (b..=a).rev().map(Value::int).collect()
    };
    Ok(Some(Value::Array(range.into())))
}

fn glob_match(_g: &Globals, args: &[Value]) -> NativeResult {
    arity("glob.match", args, 3)?;
    let pattern = args[0]
        .as_str()
        .ok_or_else(|| BuiltinError::msg("glob.match: pattern must be a string"))?;
    let subject = args[2]
        .as_str()
        .ok_or_else(|| BuiltinError::msg("glob.match: match must be a string"))?;
    let delims: Vec<char> = match &args[1] {
        Value::Null => vec!['.'],
        Value::Array(a) => {
            let mut out = Vec::new();
            for d in a.iter() {
                let s = d
                    .as_str()
                    .ok_or_else(|| BuiltinError::msg("glob.match: delimiters must be strings"))?;
                out.extend(s.chars());
            }
            out
        }
        other => {
            return Err(BuiltinError::msg(format!(
                "glob.match: expected delimiter array or null, got {}",
                other.type_name()
            )));
        }
    };
    let rx = glob_to_regex(pattern, &delims)?;
    let re = regex::Regex::new(&rx)
        .map_err(|e| BuiltinError::msg(format!("glob.match: bad pattern: {e}")))?;
    Ok(Some(Value::Bool(re.is_match(subject))))
}

/// Translate a glob into an anchored regex. `*` stays within one
/// delimiter-separated segment, `**` crosses, `?` is one non-delimiter
/// character, `[...]`/`[!...]` are character classes.
fn glob_to_regex(pattern: &str, delims: &[char]) -> Result<String, BuiltinError> {
    let class: String = delims.iter().map(|c| regex::escape(&c.to_string())).collect();
    let non_delim = if class.is_empty() {
        ".".to_string()
    } else {
        format!("[^{class}]")
    };

    let mut rx = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    rx.push_str(".*");
                } else {
                    rx.push_str(&non_delim);
                    rx.push('*');
                }
            }
            '?' => rx.push_str(&non_delim),
            '[' => {
                rx.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    rx.push('^');
                }
                let mut closed = false;
                for cc in chars.by_ref() {
                    if cc == ']' {
                        closed = true;
                        rx.push(']');
                        break;
                    }
                    if cc == '\\' {
                        rx.push('\\');
                    }
                    rx.push(cc);
                }
                if !closed {
                    return Err(BuiltinError::msg(
                        "glob.match: unterminated character class",
                    ));
                }
            }
            other => rx.push_str(&regex::escape(&other.to_string())),
        }
    }
    rx.push('$');
    Ok(rx)
}

fn print(g: &Globals, args: &[Value]) -> NativeResult {
    let msg = args
        .iter()
        .map(render)
        .collect::<Vec<_>>()
        .join(" ");
    match &g.print_hook {
        Some(hook) => hook(&msg),
        None => tracing::debug!(target: "verdict::print", "{msg}"),
    }
    Ok(Some(Value::Bool(true)))
}

/// Human rendering: strings bare, everything else as compact JSON.
fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.to_string(),
        other => serde_json::to_string(&other.to_json())
            .unwrap_or_else(|_| other.type_name().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CancelToken, Globals, GlobalsConfig};
    use std::collections::HashMap;
    use std::rc::Rc;
    use std::time::SystemTime;

    fn globals() -> Rc<Globals> {
        Globals::new(GlobalsConfig {
            cancel: CancelToken::new(),
            time: SystemTime::UNIX_EPOCH,
            seed: 0,
            instruction_limit: 0,
            builtins: HashMap::new(),
            interquery: None,
            ndb: None,
            print_hook: None,
            capabilities: None,
        })
    }

    fn call(name: &str, args: &[Value]) -> NativeResult {
        let g = globals();
        let wrapped: Vec<Option<Value>> = args.iter().cloned().map(Some).collect();
        dispatch(&g, name, &wrapped).expect("native builtin")
    }

    fn arr(vals: Vec<Value>) -> Value {
        Value::Array(vals.into())
    }

    #[test]
    fn test_count() {
        assert_eq!(call("count", &[Value::string("héllo")]).unwrap(), Some(Value::int(5)));
        assert_eq!(
            call("count", &[arr(vec![Value::Null, Value::Null])]).unwrap(),
            Some(Value::int(2))
        );
        assert!(call("count", &[Value::int(1)]).is_err());
    }

    #[test]
    fn test_concat() {
        let parts = arr(vec![Value::string("a"), Value::string("b")]);
        assert_eq!(
            call("concat", &[Value::string("/"), parts]).unwrap(),
            Some(Value::string("a/b"))
        );
    }

    #[test]
    fn test_sprintf() {
        let out = call(
            "sprintf",
            &[
                Value::string("%s=%d (%v) %f %%"),
                arr(vec![
                    Value::string("x"),
                    Value::int(7),
                    Value::Bool(true),
                    Value::float(1.5),
                ]),
            ],
        )
        .unwrap();
        assert_eq!(out, Some(Value::string("x=7 (true) 1.500000 %")));
    }

    #[test]
    fn test_member() {
        let set: Set = [Value::int(1), Value::int(2)].into_iter().collect();
        assert_eq!(
            call("member", &[Value::int(2), Value::Set(set)]).unwrap(),
            Some(Value::Bool(true))
        );
        assert_eq!(
            call("member", &[Value::int(9), arr(vec![Value::int(1)])]).unwrap(),
            Some(Value::Bool(false))
        );
    }

    #[test]
    fn test_object_get_path() {
        let mut inner = Object::new();
        inner.insert(Value::string("b"), Value::int(5));
        let mut obj = Object::new();
        obj.insert(Value::string("a"), Value::Object(inner));
        let path = arr(vec![Value::string("a"), Value::string("b")]);
        assert_eq!(
            call("object.get", &[Value::Object(obj.clone()), path, Value::Null]).unwrap(),
            Some(Value::int(5))
        );
        let missing = arr(vec![Value::string("a"), Value::string("zz")]);
        assert_eq!(
            call("object.get", &[Value::Object(obj), missing, Value::int(-1)]).unwrap(),
            Some(Value::int(-1))
        );
    }

    #[test]
    fn test_object_remove_filter() {
        let mut obj = Object::new();
        obj.insert(Value::string("a"), Value::int(1));
        obj.insert(Value::string("b"), Value::int(2));

        let removed = call(
            "object.remove",
            &[Value::Object(obj.clone()), arr(vec![Value::string("a")])],
        )
        .unwrap()
        .unwrap();
        let Value::Object(removed) = removed else { panic!() };
        assert!(removed.get(&Value::string("a")).is_none());
        assert!(removed.get(&Value::string("b")).is_some());

        let filtered = call(
            "object.filter",
            &[Value::Object(obj), arr(vec![Value::string("a")])],
        )
        .unwrap()
        .unwrap();
        let Value::Object(filtered) = filtered else { panic!() };
        assert_eq!(filtered.len(), 1);
        assert!(filtered.get(&Value::string("a")).is_some());
    }

    #[test]
    fn test_walk_yields_every_node() {
        let mut obj = Object::new();
        obj.insert(Value::string("xs"), arr(vec![Value::int(1)]));
        let out = call("walk", &[Value::Object(obj)]).unwrap().unwrap();
        let Value::Array(pairs) = out else { panic!() };
        // Root, the array, and the element.
        assert_eq!(pairs.len(), 3);
        let Some(Value::Array(first)) = pairs.get(0) else { panic!() };
        assert_eq!(first.get(0), Some(&arr(vec![])));
    }

    #[test]
    fn test_type_tests_undefined_on_mismatch() {
        assert_eq!(call("is_number", &[Value::int(1)]).unwrap(), Some(Value::Bool(true)));
        assert_eq!(call("is_number", &[Value::string("1")]).unwrap(), None);
        assert_eq!(call("type_name", &[Value::Null]).unwrap(), Some(Value::string("null")));
    }

    #[test]
    fn test_json_round_trip() {
        let parsed = call("json.unmarshal", &[Value::string(r#"{"a":[1,2]}"#)])
            .unwrap()
            .unwrap();
        let rendered = call("json.marshal", &[parsed]).unwrap().unwrap();
        assert_eq!(rendered, Value::string(r#"{"a":[1,2]}"#));
        assert!(call("json.unmarshal", &[Value::string("{oops")]).is_err());
    }

    #[test]
    fn test_numbers_range_both_directions() {
        assert_eq!(
            call("numbers.range", &[Value::int(1), Value::int(3)]).unwrap(),
            Some(arr(vec![Value::int(1), Value::int(2), Value::int(3)]))
        );
        assert_eq!(
            call("numbers.range", &[Value::int(2), Value::int(0)]).unwrap(),
            Some(arr(vec![Value::int(2), Value::int(1), Value::int(0)]))
        );
    }

    #[test]
    fn test_glob_match() {
        let null = Value::Null;
        let cases = [
            ("api.*", "api.users", true),
            ("api.*", "api.users.list", false),
            ("api.**", "api.users.list", true),
            ("api.?", "api.x", true),
            ("[ab]pi.*", "api.users", true),
            ("[!ab]pi.*", "api.users", false),
        ];
        for (pat, subject, want) in cases {
            let got = call(
                "glob.match",
                &[Value::string(pat), null.clone(), Value::string(subject)],
            )
            .unwrap();
            assert_eq!(got, Some(Value::Bool(want)), "{pat} vs {subject}");
        }
    }

    #[test]
    fn test_undefined_argument_short_circuits() {
        let g = globals();
        let out = dispatch(&g, "count", &[None]).expect("native");
        assert!(matches!(out, Ok(None)));
    }
}
