//! `math_calculate` — evaluates mathematical expressions.
//!
//! Recursive-descent parser over `+ - * / % ^ !`, parentheses, the
//! constants `pi` and `e`, and the functions `sin cos tan asin acos atan
//! sinh cosh tanh sqrt abs ln log log2 log10 exp floor ceil round`.
//! Trigonometry works in radians unless degrees are requested.

use async_trait::async_trait;
use cortex_core::error::ToolError;
use cortex_core::tool::Tool;

pub const NAME: &str = "math_calculate";

/// Largest n with a finite n! in f64.
const MAX_FACTORIAL: f64 = 170.0;

/// Deepest nesting of parentheses, calls and prefix signs accepted.
pub const MAX_DEPTH: usize = 256;

pub struct MathTool;

#[async_trait]
impl Tool for MathTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Evaluate a mathematical expression. Supports + - * / % ^ !, parentheses, pi, e, \
         trigonometric, logarithmic and rounding functions."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "The expression to evaluate, e.g. 'sqrt(2) * (3 + 4)^2'"
                },
                "angle_unit": {
                    "type": "string",
                    "enum": ["radians", "degrees"],
                    "description": "Unit for trigonometric functions (default radians)"
                }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let expr = arguments["expression"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'expression' argument".into()))?;
        let degrees = match arguments["angle_unit"].as_str() {
            None | Some("radians") | Some("rad") => arguments["degrees"].as_bool().unwrap_or(false),
            Some("degrees") | Some("deg") => true,
            Some(other) => {
                return Err(ToolError::InvalidArguments(format!("Unknown angle_unit: {other}")));
            }
        };

        let value = evaluate_with(expr, degrees).map_err(|reason| ToolError::ExecutionFailed {
            tool_name: NAME.into(),
            reason,
        })?;

        Ok(serde_json::json!({ "expression": expr, "result": value }))
    }
}

// ── Recursive-descent expression evaluator ────────────────────────────────

/// Evaluate in radians.
pub fn evaluate(expr: &str) -> Result<f64, String> {
    evaluate_with(expr, false)
}

pub fn evaluate_with(expr: &str, degrees: bool) -> Result<f64, String> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        depth: 0,
        degrees,
    };
    let result = parser.parse_expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(format!(
            "Unexpected token at position {}: {:?}",
            parser.pos, parser.tokens[parser.pos]
        ));
    }
    real(result)
}

fn real(v: f64) -> Result<f64, String> {
    if v.is_finite() {
        Ok(v)
    } else {
        Err("Result is not a real number".into())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    Bang,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let single = match chars[i] {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
                continue;
            }
            '+' => Some(Token::Plus),
            '-' => Some(Token::Minus),
            '*' | '×' => Some(Token::Star),
            '/' | '÷' => Some(Token::Slash),
            '%' => Some(Token::Percent),
            '^' => Some(Token::Caret),
            '!' => Some(Token::Bang),
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '√' => Some(Token::Ident("sqrt".into())),
            'π' => Some(Token::Ident("pi".into())),
            _ => None,
        };
        if let Some(tok) = single {
            tokens.push(tok);
            i += 1;
            continue;
        }

        let c = chars[i];
        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            // Scientific notation: 1e-3
            if i < chars.len()
                && (chars[i] == 'e' || chars[i] == 'E')
                && chars
                    .get(i + 1)
                    .is_some_and(|n| n.is_ascii_digit() || ((*n == '-' || *n == '+') && chars.get(i + 2).is_some_and(|d| d.is_ascii_digit())))
            {
                i += 2;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let num_str: String = chars[start..i].iter().collect();
            let num: f64 = num_str
                .parse()
                .map_err(|_| format!("Invalid number: {num_str}"))?;
            tokens.push(Token::Number(num));
        } else if c.is_ascii_alphabetic() {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect::<String>().to_ascii_lowercase()));
        } else {
            return Err(format!("Unexpected character: '{c}'"));
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    degrees: bool,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    // expr = term (('+' | '-') term)*
    fn parse_expr(&mut self) -> Result<f64, String> {
        let mut left = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.consume();
                    left += self.parse_term()?;
                }
                Some(Token::Minus) => {
                    self.consume();
                    left -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // term = unary (('*' | '/' | '%') unary)*
    fn parse_term(&mut self) -> Result<f64, String> {
        let mut left = self.parse_unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.consume();
                    left *= self.parse_unary()?;
                }
                Some(Token::Slash) => {
                    self.consume();
                    let right = self.parse_unary()?;
                    if right == 0.0 {
                        return Err("Division by zero".into());
                    }
                    left /= right;
                }
                Some(Token::Percent) => {
                    self.consume();
                    let right = self.parse_unary()?;
                    if right == 0.0 {
                        return Err("Modulo by zero".into());
                    }
                    left %= right;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // unary = ('-' | '+') unary | power
    fn parse_unary(&mut self) -> Result<f64, String> {
        if self.depth >= MAX_DEPTH {
            return Err(format!("Expression nested deeper than {MAX_DEPTH} levels"));
        }
        self.depth += 1;
        let v = self.parse_signed();
        self.depth -= 1;
        v
    }

    fn parse_signed(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                Ok(-self.parse_unary()?)
            }
            Some(Token::Plus) => {
                self.consume();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    // power = postfix ('^' unary)?   (right-associative)
    fn parse_power(&mut self) -> Result<f64, String> {
        let base = self.parse_postfix()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exp = self.parse_unary()?;
            let v = base.powf(exp);
            if v.is_nan() {
                return Err(format!("({base})^{exp} is not a real number"));
            }
            return Ok(v);
        }
        Ok(base)
    }

    // postfix = primary '!'*
    fn parse_postfix(&mut self) -> Result<f64, String> {
        let mut v = self.parse_primary()?;
        while let Some(Token::Bang) = self.peek() {
            self.consume();
            v = factorial(v)?;
        }
        Ok(v)
    }

    // primary = NUMBER | IDENT '(' expr ')' | IDENT | '(' expr ')'
    fn parse_primary(&mut self) -> Result<f64, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(n),
            Some(Token::LParen) => {
                let val = self.parse_expr()?;
                self.expect_rparen()?;
                Ok(val)
            }
            Some(Token::Ident(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_expr()?;
                    self.expect_rparen()?;
                    self.call(&name, arg)
                } else {
                    match name.as_str() {
                        "pi" => Ok(std::f64::consts::PI),
                        "e" => Ok(std::f64::consts::E),
                        _ => Err(format!("Unknown identifier: {name}")),
                    }
                }
            }
            Some(tok) => Err(format!("Unexpected token: {tok:?}")),
            None => Err("Unexpected end of expression".into()),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), String> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err("Expected closing parenthesis".into()),
        }
    }

    fn call(&self, name: &str, x: f64) -> Result<f64, String> {
        let to_rad = |v: f64| if self.degrees { v.to_radians() } else { v };
        let from_rad = |v: f64| if self.degrees { v.to_degrees() } else { v };
        let v = match name {
            "sin" => to_rad(x).sin(),
            "cos" => to_rad(x).cos(),
            "tan" => to_rad(x).tan(),
            "asin" => {
                if !(-1.0..=1.0).contains(&x) {
                    return Err(format!("asin({x}) is undefined"));
                }
                from_rad(x.asin())
            }
            "acos" => {
                if !(-1.0..=1.0).contains(&x) {
                    return Err(format!("acos({x}) is undefined"));
                }
                from_rad(x.acos())
            }
            "atan" => from_rad(x.atan()),
            "sinh" => x.sinh(),
            "cosh" => x.cosh(),
            "tanh" => x.tanh(),
            "sqrt" => {
                if x < 0.0 {
                    return Err(format!("Square root of negative number: {x}"));
                }
                x.sqrt()
            }
            "abs" => x.abs(),
            "ln" | "log" | "log2" | "log10" => {
                if x <= 0.0 {
                    return Err(format!("{name}({x}) is undefined"));
                }
                match name {
                    "ln" => x.ln(),
                    "log2" => x.log2(),
                    _ => x.log10(),
                }
            }
            "exp" => x.exp(),
            "floor" => x.floor(),
            "ceil" => x.ceil(),
            "round" => x.round(),
            _ => return Err(format!("Unknown function: {name}")),
        };
        real(v)
    }
}

fn factorial(n: f64) -> Result<f64, String> {
    if n < 0.0 || n.fract() != 0.0 {
        return Err(format!("Factorial needs a non-negative integer, got {n}"));
    }
    if n > MAX_FACTORIAL {
        return Err(format!("Factorial argument {n} exceeds {MAX_FACTORIAL}"));
    }
    Ok((1..=n as u64).fold(1.0, |acc, k| acc * k as f64))
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-9 * b.abs().max(1.0)
    }

    #[test]
    fn precedence_and_parentheses() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("((1 + 2) * (3 + 4))").unwrap(), 21.0);
        assert_eq!(evaluate("10 % 4").unwrap(), 2.0);
        assert!(close(evaluate("(10 + 5) / 3 - 2 * (1 + 1)").unwrap(), 1.0));
    }

    #[test]
    fn power_is_right_associative_and_binds_tighter_than_minus() {
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("-2 ^ 2").unwrap(), -4.0);
        assert_eq!(evaluate("2 ^ -1").unwrap(), 0.5);
    }

    #[test]
    fn factorial_rules() {
        assert_eq!(evaluate("5!").unwrap(), 120.0);
        assert_eq!(evaluate("0!").unwrap(), 1.0);
        assert!(evaluate("170!").unwrap().is_finite());
        assert!(evaluate("171!").is_err());
        assert!(evaluate("2.5!").is_err());
    }

    #[test]
    fn functions_and_constants() {
        assert!(close(evaluate("sqrt(2)").unwrap(), std::f64::consts::SQRT_2));
        assert!(close(evaluate("sin(pi / 2)").unwrap(), 1.0));
        assert!(close(evaluate_with("sin(30)", true).unwrap(), 0.5));
        assert!(close(evaluate_with("acos(0)", true).unwrap(), 90.0));
        assert!(close(evaluate("log(1000)").unwrap(), 3.0));
        assert!(close(evaluate("ln(e)").unwrap(), 1.0));
        assert!(close(evaluate("exp(1) - e").unwrap(), 0.0));
        assert!(close(evaluate("1.5e3 + 2E-1").unwrap(), 1500.2));
    }

    #[test]
    fn explicit_errors() {
        assert_eq!(evaluate("1 / 0").unwrap_err(), "Division by zero");
        assert!(evaluate("5 % 0").is_err());
        assert!(evaluate("sqrt(-4)").unwrap_err().contains("negative"));
        assert!(evaluate("(-4)^0.5").unwrap_err().contains("not a real number"));
        assert!(evaluate("log(0)").is_err());
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("").is_err());
        assert!(evaluate("foo(1)").is_err());
    }

    #[test]
    fn nesting_depth_is_capped() {
        let ok = format!("{}1{}", "(".repeat(MAX_DEPTH - 1), ")".repeat(MAX_DEPTH - 1));
        assert_eq!(evaluate(&ok).unwrap(), 1.0);

        let deep = format!("{}1{}", "(".repeat(1000), ")".repeat(1000));
        assert!(evaluate(&deep).unwrap_err().contains("nested deeper"));
        assert!(evaluate(&format!("{}1", "-".repeat(10_000))).is_err());
        assert!(evaluate(&format!("{}1{}", "sqrt(".repeat(1000), ")".repeat(1000))).is_err());
    }

    #[tokio::test]
    async fn deeply_nested_expression_is_a_tool_error() {
        let expr = format!("{}2{}", "(".repeat(1000), ")".repeat(1000));
        let err = MathTool
            .execute(serde_json::json!({ "expression": expr }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
    }

    #[tokio::test]
    async fn tool_returns_result_field() {
        let out = MathTool
            .execute(serde_json::json!({"expression": "cos(60)", "angle_unit": "degrees"}))
            .await
            .unwrap();
        assert!(close(out["result"].as_f64().unwrap(), 0.5));

        let err = MathTool
            .execute(serde_json::json!({"expression": "1/0"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Division by zero"));
        assert!(MathTool.execute(serde_json::json!({})).await.is_err());
    }
}
