//! Method signature notations
//!
//! Defect tables name methods either in JVM descriptor notation
//! (`pkg.Class.method(I[JLjava/lang/String;)V`) or in a dotted native notation
//! (`pkg.Class:method(int;long[];String;):`). Both converters produce the
//! canonical native form:
//!
//! ```text
//! <class>:<method>(<param>;<param>;...)<return>:
//! ```
//!
//! where `void` returns are empty, class references keep only their simple
//! name, and generic arguments are dropped.

/// Type alias for signature conversion results
pub type SignatureResult<T> = Result<T, SignatureError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignatureError {
    #[error("Unparsable signature '{signature}': {reason}")]
    Unparsable { signature: String, reason: String },
}

fn unparsable(signature: &str, reason: impl Into<String>) -> SignatureError {
    SignatureError::Unparsable {
        signature: signature.to_string(),
        reason: reason.into(),
    }
}

/// Convert a fully qualified JVM-notation method to native notation.
///
/// `class_name` names the class under test and is used for constructors of
/// outer classes.
pub fn jvm_to_native(signature: &str, class_name: &str) -> SignatureResult<String> {
    let (simple, params, returns) = split_signature(signature)?;

    let returns = returns.trim_end_matches(':');

    let simple = rename_constructor(simple, class_name);
    let simple = separate_class_and_method(&simple)
        .ok_or_else(|| unparsable(signature, "no class qualifier"))?;

    let params = parse_descriptors(params).map_err(|reason| unparsable(signature, reason))?;
    let returns = match returns {
        "" | "V" => String::new(),
        other => {
            let mut parsed =
                parse_descriptors(other).map_err(|reason| unparsable(signature, reason))?;
            if parsed.len() != 1 {
                return Err(unparsable(signature, "return type is not a single descriptor"));
            }
            parsed.remove(0)
        }
    };

    Ok(assemble(&simple, &params, &returns))
}

/// Normalise a native-notation method as it appears in a defect table:
/// `void` returns are dropped, varargs become arrays and generics are removed.
pub fn normalize_native(signature: &str) -> SignatureResult<String> {
    let cleaned = signature
        .replace(")void:", "):")
        .replace("...", "[]")
        .replace("<?>", "");

    let open = cleaned
        .find('(')
        .ok_or_else(|| unparsable(signature, "missing '('"))?;
    let close = cleaned[open..]
        .find(')')
        .map(|offset| open + offset)
        .ok_or_else(|| unparsable(signature, "missing ')'"))?;
    let end = cleaned
        .rfind(':')
        .filter(|&end| end > close)
        .ok_or_else(|| unparsable(signature, "missing trailing ':'"))?;

    let params: Vec<String> = cleaned[open + 1..close]
        .split(';')
        .filter(|param| !param.is_empty())
        .map(|param| strip_generics(param).to_string())
        .collect();
    let returns = strip_generics(&cleaned[close + 1..end]);

    Ok(assemble(&cleaned[..open], &params, returns))
}

fn split_signature(signature: &str) -> SignatureResult<(&str, &str, &str)> {
    let open = signature
        .find('(')
        .ok_or_else(|| unparsable(signature, "missing '('"))?;
    let close = signature[open..]
        .find(')')
        .map(|offset| open + offset)
        .ok_or_else(|| unparsable(signature, "missing ')'"))?;

    Ok((
        &signature[..open],
        &signature[open + 1..close],
        &signature[close + 1..],
    ))
}

fn assemble(simple: &str, params: &[String], returns: &str) -> String {
    let mut converted = String::with_capacity(simple.len() + 16);
    converted.push_str(simple);
    converted.push('(');
    for param in params {
        converted.push_str(param);
        converted.push(';');
    }
    converted.push(')');
    converted.push_str(returns);
    converted.push(':');
    converted
}

fn rename_constructor(simple: &str, class_name: &str) -> String {
    if !simple.ends_with("<init>") {
        return simple.to_string();
    }

    let constructor = match (simple.find('$'), simple.rfind('.')) {
        (Some(dollar), Some(dot)) if dollar < dot => &simple[dollar + 1..dot],
        _ => class_name.rsplit('.').next().unwrap_or(class_name),
    };
    simple.replace("<init>", constructor)
}

fn separate_class_and_method(simple: &str) -> Option<String> {
    let dot = simple.rfind('.')?;
    Some(format!("{}:{}", &simple[..dot], &simple[dot + 1..]))
}

fn strip_generics(type_name: &str) -> &str {
    match type_name.find('<') {
        Some(index) => &type_name[..index],
        None => type_name,
    }
}

fn primitive_name(code: char) -> Option<&'static str> {
    Some(match code {
        'Z' => "boolean",
        'B' => "byte",
        'C' => "char",
        'S' => "short",
        'I' => "int",
        'J' => "long",
        'F' => "float",
        'D' => "double",
        _ => return None,
    })
}

/// Simple name of a `java/lang/Outer$Inner` reference: `Inner`
fn simple_class_name(reference: &str) -> &str {
    let reference = strip_generics(reference);
    let simple = reference.rsplit('/').next().unwrap_or(reference);
    match simple.find('$') {
        Some(index) => &simple[index + 1..],
        None => simple,
    }
}

/// Parse a run of field descriptors. Stray `;` between descriptors are
/// treated as separators.
fn parse_descriptors(descriptors: &str) -> Result<Vec<String>, String> {
    let chars: Vec<char> = descriptors.chars().collect();
    let mut parsed = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        let mut dimensions = 0;
        while index < chars.len() && chars[index] == '[' {
            dimensions += 1;
            index += 1;
        }

        let Some(&code) = chars.get(index) else {
            return Err("array marker without element type".to_string());
        };

        let base = match code {
            ';' if dimensions == 0 => {
                index += 1;
                continue;
            }
            'L' => {
                let end = class_reference_end(&chars, index + 1)
                    .ok_or_else(|| "unterminated class reference".to_string())?;
                let reference: String = chars[index + 1..end].iter().collect();
                index = end + 1;
                simple_class_name(&reference).to_string()
            }
            other => {
                let name = primitive_name(other)
                    .ok_or_else(|| format!("unexpected character '{}'", other))?;
                index += 1;
                name.to_string()
            }
        };

        parsed.push(format!("{}{}", base, "[]".repeat(dimensions)));
    }

    Ok(parsed)
}

/// Index of the `;` closing a class reference, skipping generic arguments
fn class_reference_end(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, &c) in chars[start..].iter().enumerate() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ';' if depth == 0 => return Some(start + offset),
            _ => {}
        }
    }
    None
}
