//! `calculator` built-in tool.
//!
//! The evaluator is an evalexpr-backed scientific calculator: arithmetic, trigonometric and
//! hyperbolic functions (plus their reciprocals, which evalexpr doesn't ship), logarithms, and
//! bracket-array statistics (`mean`, `median`, `std`, ...). It has no attribute access, no
//! lambdas, and no syscall surface to reject in the first place — every name it resolves is one
//! of the whitelisted `math::*` functions or a literal number.

use std::collections::HashMap;

use async_trait::async_trait;
use evalexpr::ContextWithMutableVariables;
use serde_json::Value;

use crate::config::Settings;
use crate::error::GatewayError;
use crate::tools::{ParamType, SessionContext, Tool, ToolMetadata, ToolParameter};

type EvalResult = Result<f64, String>;

/// Stateless expression engine. Cheap to construct; safe to share across calls.
#[derive(Clone, Default)]
struct Engine;

impl Engine {
    fn evaluate(&self, expression: &str) -> EvalResult {
        let expression = expression.trim();
        if let Ok(result) = self.try_statistical_function(expression) {
            return Ok(result);
        }
        self.evaluate_math_expression(expression)
    }

    fn evaluate_math_expression(&self, expression: &str) -> EvalResult {
        let expr = self.prepare_expression(expression);

        let mut context: evalexpr::HashMapContext = evalexpr::HashMapContext::new();
        let _ = context.set_value("math::PI".to_string(), evalexpr::Value::Float(std::f64::consts::PI));
        let _ = context.set_value("math::E".to_string(), evalexpr::Value::Float(std::f64::consts::E));

        match evalexpr::eval_with_context(&expr, &context) {
            Ok(value) => value.as_number().map_err(|_| "result is not a number".to_string()),
            Err(e) => Err(format!("evaluation error: {e}")),
        }
    }

    /// Rewrite standard math notation into evalexpr's `math::` namespace, expanding the
    /// reciprocal trig/hyperbolic functions and the two log bases it has no native support for.
    fn prepare_expression(&self, expr: &str) -> String {
        let mut prepared = expr.trim().to_string();

        prepared = prepared.replace("arcsin", "asin");
        prepared = prepared.replace("arccos", "acos");
        prepared = prepared.replace("arctan", "atan");
        prepared = prepared.replace("arcsinh", "asinh");
        prepared = prepared.replace("arccosh", "acosh");
        prepared = prepared.replace("arctanh", "atanh");
        prepared = prepared.replace("cosec", "csc");

        // log(x) -> ln(x)/ln(10), log2(x) -> ln(x)/ln(2); must run before function conversion
        // so the resulting ln() calls get the math:: prefix too.
        prepared = self.replace_log_base10(&prepared);
        prepared = self.replace_log_base2(&prepared);

        prepared = self.rewrite_function(&prepared, "csc", "1/math::sin");
        prepared = self.rewrite_function(&prepared, "sec", "1/math::cos");
        prepared = self.rewrite_function(&prepared, "cot", "1/math::tan");
        prepared = self.rewrite_function(&prepared, "csch", "1/math::sinh");
        prepared = self.rewrite_function(&prepared, "sech", "1/math::cosh");
        prepared = self.rewrite_function(&prepared, "coth", "1/math::tanh");

        prepared = self.convert_to_evalexpr_functions(&prepared);
        prepared = prepared.replace("**", "^");

        // pi before e: e would otherwise eat the "e" inside constants it shouldn't touch.
        prepared = self.replace_constant(&prepared, "pi", "math::PI");
        prepared = self.replace_constant(&prepared, "e", "math::E");

        prepared
    }

    /// Replace a bare identifier with `replacement`, but only at word boundaries — so `e` inside
    /// `exp` or `mean` is left alone.
    fn replace_constant(&self, expr: &str, constant: &str, replacement: &str) -> String {
        let mut result = String::new();
        let chars: Vec<char> = expr.chars().collect();
        let constant_chars: Vec<char> = constant.chars().collect();
        let constant_len = constant_chars.len();

        let mut i = 0;
        while i < chars.len() {
            if i + constant_len <= chars.len() {
                let substring: String = chars[i..i + constant_len].iter().collect();
                if substring == constant {
                    let is_word_char_before = i > 0 && chars[i - 1].is_alphanumeric();
                    let is_word_char_after = i + constant_len < chars.len() && chars[i + constant_len].is_alphanumeric();
                    if !is_word_char_before && !is_word_char_after {
                        result.push_str(replacement);
                        i += constant_len;
                        continue;
                    }
                }
            }
            result.push(chars[i]);
            i += 1;
        }
        result
    }

    /// Prefix the functions evalexpr natively supports with `math::`, longest names first so
    /// `atan2` doesn't get clobbered by the `atan` rule.
    fn convert_to_evalexpr_functions(&self, expr: &str) -> String {
        let functions = [
            ("atan2", "math::atan2"),
            ("sinh", "math::sinh"),
            ("cosh", "math::cosh"),
            ("tanh", "math::tanh"),
            ("asin", "math::asin"),
            ("acos", "math::acos"),
            ("atan", "math::atan"),
            ("sqrt", "math::sqrt"),
            ("abs", "math::abs"),
            ("ln", "math::ln"),
            ("exp", "math::exp"),
            ("sin", "math::sin"),
            ("cos", "math::cos"),
            ("tan", "math::tan"),
        ];

        let mut result = expr.to_string();
        for (func_name, math_func) in functions {
            let chars: Vec<char> = result.chars().collect();
            let mut new_result = String::new();
            let mut i = 0;
            while i < chars.len() {
                if i + func_name.len() <= chars.len() {
                    let substring: String = chars[i..i + func_name.len()].iter().collect();
                    if substring == func_name {
                        let already_prefixed = i >= 6 && chars[i - 6..i].iter().collect::<String>() == "math::";
                        if !already_prefixed {
                            let word_boundary_before = i == 0 || !chars[i - 1].is_alphanumeric();
                            let mut j = i + func_name.len();
                            while j < chars.len() && chars[j].is_whitespace() {
                                j += 1;
                            }
                            if word_boundary_before && j < chars.len() && chars[j] == '(' {
                                new_result.push_str(math_func);
                                i += func_name.len();
                                continue;
                            }
                        }
                    }
                }
                new_result.push(chars[i]);
                i += 1;
            }
            result = new_result;
        }
        result
    }

    /// Rewrite every `func_name(` occurrence to `replacement(`, leaving the argument untouched
    /// (used for the reciprocal trig/hyperbolic functions evalexpr doesn't have).
    fn rewrite_function(&self, expr: &str, func_name: &str, replacement: &str) -> String {
        let pattern = format!("{func_name}(");
        if !expr.contains(&pattern) {
            return expr.to_string();
        }

        let mut result = String::new();
        let mut chars = expr.chars().peekable();
        let search_bytes = pattern.as_bytes();

        while let Some(ch) = chars.next() {
            if ch == search_bytes[0] as char {
                let mut match_str = ch.to_string();
                let mut temp_chars = chars.clone();
                let mut matched = true;
                for &byte in &search_bytes[1..] {
                    if let Some(next_ch) = temp_chars.next() {
                        match_str.push(next_ch);
                        if next_ch as u8 != byte {
                            matched = false;
                            break;
                        }
                    } else {
                        matched = false;
                        break;
                    }
                }
                if matched {
                    result.push_str(replacement);
                    result.push('(');
                    for _ in 1..search_bytes.len() {
                        chars.next();
                    }
                } else {
                    result.push(ch);
                }
            } else {
                result.push(ch);
            }
        }
        result
    }

    fn replace_log_base10(&self, expr: &str) -> String {
        if !expr.contains("log(") {
            return expr.to_string();
        }
        let mut result = String::new();
        let mut chars = expr.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == 'l' {
                let mut temp_chars = chars.clone();
                let is_log = temp_chars.next() == Some('o') && temp_chars.next() == Some('g') && temp_chars.next() == Some('(');
                if is_log && !expr[result.len()..].starts_with("log2(") {
                    chars.next();
                    chars.next();
                    chars.next();
                    let arg = consume_balanced(&mut chars);
                    result.push_str("math::ln(");
                    result.push_str(&arg);
                    result.push_str(")/math::ln(10)");
                } else {
                    result.push(ch);
                }
            } else {
                result.push(ch);
            }
        }
        result
    }

    fn replace_log_base2(&self, expr: &str) -> String {
        if !expr.contains("log2(") {
            return expr.to_string();
        }
        let mut result = String::new();
        let mut chars = expr.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch == 'l' {
                let mut temp_chars = chars.clone();
                let is_log2 = temp_chars.next() == Some('o')
                    && temp_chars.next() == Some('g')
                    && temp_chars.next() == Some('2')
                    && temp_chars.next() == Some('(');
                if is_log2 {
                    chars.next();
                    chars.next();
                    chars.next();
                    chars.next();
                    let arg = consume_balanced(&mut chars);
                    result.push_str("math::ln(");
                    result.push_str(&arg);
                    result.push_str(")/math::ln(2)");
                } else {
                    result.push(ch);
                }
            } else {
                result.push(ch);
            }
        }
        result
    }

    fn try_statistical_function(&self, expression: &str) -> EvalResult {
        let expr = expression.trim();
        if !expr.contains('[') && !expr.contains('(') {
            return Err("not a statistical function".to_string());
        }
        let paren_idx = expr.find('(').ok_or_else(|| "not a statistical function".to_string())?;
        let func_name = expr[..paren_idx].trim().to_lowercase();
        let args_end = expr.rfind(')').ok_or_else(|| "missing closing parenthesis".to_string())?;
        let args = expr[paren_idx + 1..args_end].trim();

        match func_name.as_str() {
            "mean" => self.stat_mean(args),
            "median" => self.stat_median(args),
            "mode" => self.stat_mode(args),
            "std" => self.stat_std(args),
            "stdpop" => self.stat_stdpop(args),
            "var" => self.stat_var(args),
            "varpop" => self.stat_varpop(args),
            "sum" => self.stat_sum(args),
            "count" => self.stat_count(args),
            "min" => self.stat_min(args),
            "max" => self.stat_max(args),
            _ => Err("not a known statistical function".to_string()),
        }
    }

    fn parse_array(&self, arg: &str) -> Result<Vec<f64>, String> {
        let arg = arg.trim();
        let content = if (arg.starts_with('[') && arg.ends_with(']')) || (arg.starts_with('(') && arg.ends_with(')')) {
            &arg[1..arg.len() - 1]
        } else {
            arg
        };
        if content.trim().is_empty() {
            return Err("empty array".to_string());
        }
        content
            .split(',')
            .map(|s| s.trim().parse::<f64>().map_err(|_| format!("invalid number in array: {s}")))
            .collect()
    }

    fn stat_mean(&self, arg: &str) -> EvalResult {
        let values = self.parse_array(arg)?;
        Ok(values.iter().sum::<f64>() / values.len() as f64)
    }

    fn stat_median(&self, arg: &str) -> EvalResult {
        let mut values = self.parse_array(arg)?;
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = values.len();
        if n % 2 == 1 {
            Ok(values[n / 2])
        } else {
            Ok((values[n / 2 - 1] + values[n / 2]) / 2.0)
        }
    }

    fn stat_mode(&self, arg: &str) -> EvalResult {
        let values = self.parse_array(arg)?;
        let mut frequencies: HashMap<String, usize> = HashMap::new();
        for v in &values {
            *frequencies.entry(v.to_string()).or_insert(0) += 1;
        }
        let (mode_str, _) = frequencies.iter().max_by_key(|&(_, count)| count).ok_or_else(|| "empty array".to_string())?;
        mode_str.parse::<f64>().map_err(|_| "could not parse mode value".to_string())
    }

    fn stat_std(&self, arg: &str) -> EvalResult {
        let values = self.parse_array(arg)?;
        if values.len() < 2 {
            return Err("standard deviation requires at least 2 values".to_string());
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
        Ok(variance.sqrt())
    }

    fn stat_stdpop(&self, arg: &str) -> EvalResult {
        let values = self.parse_array(arg)?;
        if values.is_empty() {
            return Err("empty array".to_string());
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance = values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64;
        Ok(variance.sqrt())
    }

    fn stat_var(&self, arg: &str) -> EvalResult {
        let values = self.parse_array(arg)?;
        if values.len() < 2 {
            return Err("variance requires at least 2 values".to_string());
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Ok(values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64)
    }

    fn stat_varpop(&self, arg: &str) -> EvalResult {
        let values = self.parse_array(arg)?;
        if values.is_empty() {
            return Err("empty array".to_string());
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Ok(values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / values.len() as f64)
    }

    fn stat_sum(&self, arg: &str) -> EvalResult {
        Ok(self.parse_array(arg)?.iter().sum())
    }

    fn stat_count(&self, arg: &str) -> EvalResult {
        Ok(self.parse_array(arg)?.len() as f64)
    }

    fn stat_min(&self, arg: &str) -> EvalResult {
        Ok(self.parse_array(arg)?.iter().copied().fold(f64::INFINITY, f64::min))
    }

    fn stat_max(&self, arg: &str) -> EvalResult {
        Ok(self.parse_array(arg)?.iter().copied().fold(f64::NEG_INFINITY, f64::max))
    }
}

/// Consume characters up to (and including) the matching closing paren, tracking nesting depth.
fn consume_balanced(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut paren_count = 1;
    let mut arg = String::new();
    while paren_count > 0 {
        match chars.next() {
            Some('(') => {
                paren_count += 1;
                arg.push('(');
            }
            Some(')') => {
                paren_count -= 1;
                if paren_count > 0 {
                    arg.push(')');
                }
            }
            Some(c) => arg.push(c),
            None => break,
        }
    }
    arg
}

pub struct CalculatorTool {
    engine: Engine,
    metadata: ToolMetadata,
}

impl CalculatorTool {
    pub fn new(settings: &Settings) -> Self {
        Self {
            engine: Engine,
            metadata: ToolMetadata {
                name: "calculator".to_string(),
                description: "Evaluate a mathematical expression: arithmetic, trigonometric, \
                    logarithmic, and statistical (array) functions."
                    .to_string(),
                parameters: vec![ToolParameter::new(
                    "expression",
                    ParamType::String,
                    "the expression to evaluate, e.g. 'sqrt(16) + mean([1,2,3])'",
                )
                .required()],
                category: "math".to_string(),
                dangerous: false,
                rate_limit: Some(settings.calculator_rate_limit),
                session_aware: false,
            },
        }
    }
}

#[async_trait]
impl Tool for CalculatorTool {
    fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    async fn call(&self, params: Value, _ctx: &SessionContext) -> Result<Value, GatewayError> {
        let expression = params["expression"].as_str().ok_or_else(|| GatewayError::ToolValidation("missing 'expression'".to_string()))?;
        // Every evaluation failure here is the whitelist rejecting something: an unresolved
        // identifier (`os`, `open`, attribute access, ...), a syntax error, or an unsupported
        // construct (lambdas don't parse at all). None of that is a runtime execution fault,
        // so it surfaces as a caller-visible validation error, never a retryable one (spec.md
        // "expressions using os, open, attribute access, or lambda produce ToolValidationError").
        let result = self.engine.evaluate(expression).map_err(GatewayError::ToolValidation)?;
        Ok(serde_json::json!({ "result": result }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::execute;
    use crate::tools::RateGate;

    fn tool() -> CalculatorTool {
        CalculatorTool::new(&Settings::default())
    }

    #[tokio::test]
    async fn evaluates_arithmetic() {
        let gate = RateGate::default();
        let result = execute(&tool(), serde_json::json!({ "expression": "2 + 2 * 3" }), &SessionContext::default(), &gate).await;
        assert!(result.success);
        assert_eq!(result.output["result"], 8.0);
    }

    #[tokio::test]
    async fn evaluates_trig_reciprocal() {
        let result = tool().engine.evaluate("sec(0)").unwrap();
        assert!((result - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn evaluates_statistics() {
        let result = tool().engine.evaluate("mean([1, 2, 3, 4, 5])").unwrap();
        assert_eq!(result, 3.0);
    }

    #[tokio::test]
    async fn evaluates_log_base10() {
        let result = tool().engine.evaluate("log(100)").unwrap();
        assert!((result - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejects_missing_expression() {
        let err = tool().call(serde_json::json!({}), &SessionContext::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolValidation(_)));
    }

    #[tokio::test]
    async fn rejects_unsafe_constructs_as_validation_errors_not_execution_errors() {
        for expression in ["os.system('ls')", "open('/etc/passwd')", "__import__('os')", "lambda x: x"] {
            let err = tool().call(serde_json::json!({ "expression": expression }), &SessionContext::default()).await.unwrap_err();
            assert!(matches!(err, GatewayError::ToolValidation(_)), "expected ToolValidation for {expression:?}, got {err:?}");
        }
    }
}
