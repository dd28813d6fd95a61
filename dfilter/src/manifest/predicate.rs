// Copyright 2024 dshield developers
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Predicate expressions for conditional manifest items.
//!
//! Boolean expressions over context variables with comparisons, `AND`/`OR`/
//! `NOT`, parentheses, and a handful of named functions
//! (`isBusinessHours()`, `isOnNetwork("ssid")`, `versionCompare(a, b)`, ...).

use chrono::{DateTime, Datelike, Local, Timelike, Weekday};
use log::warn;
use std::{cmp::Ordering, collections::BTreeMap, fmt};

/// The variables a predicate may reference.
#[derive(Clone, Debug)]
pub struct EvaluationContext {
    /// Host OS version, e.g. `14.2`.
    pub os_version: String,
    /// Device family, e.g. `laptop`.
    pub device_type: String,
    /// Device model string.
    pub device_model: String,
    /// Logical location, e.g. `home`, `office`, `public`.
    pub network_location: String,
    /// Wireless network name if known.
    pub network_ssid: Option<String>,
    /// Whether a VPN tunnel is up.
    pub vpn_connected: bool,
    /// `HH:mm` wall-clock time.
    pub time_of_day: String,
    /// English day name, `Monday`..`Sunday`.
    pub day_of_week: String,
    /// Saturday or Sunday.
    pub is_weekend: bool,
    /// Free-form extra keys.
    pub custom: BTreeMap<String, String>,
}

impl Default for EvaluationContext {
    fn default() -> Self {
        let mut ctx = Self {
            os_version: String::new(),
            device_type: String::new(),
            device_model: String::new(),
            network_location: String::new(),
            network_ssid: None,
            vpn_connected: false,
            time_of_day: "00:00".into(),
            day_of_week: "Monday".into(),
            is_weekend: false,
            custom: BTreeMap::new(),
        };
        ctx.refresh_time(Local::now());
        ctx
    }
}

impl EvaluationContext {
    /// Update the time-derived fields from `now`.
    pub fn refresh_time(&mut self, now: DateTime<Local>) {
        self.time_of_day = format!("{:02}:{:02}", now.hour(), now.minute());
        self.day_of_week = match now.weekday() {
            Weekday::Mon => "Monday",
            Weekday::Tue => "Tuesday",
            Weekday::Wed => "Wednesday",
            Weekday::Thu => "Thursday",
            Weekday::Fri => "Friday",
            Weekday::Sat => "Saturday",
            Weekday::Sun => "Sunday",
        }
        .into();
        self.is_weekend = matches!(now.weekday(), Weekday::Sat | Weekday::Sun);
    }

    /// Set a custom property.
    pub fn set_custom(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom.insert(key.into(), value.into());
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        Some(match name {
            "osVersion" => Value::Str(self.os_version.clone()),
            "deviceType" => Value::Str(self.device_type.clone()),
            "deviceModel" => Value::Str(self.device_model.clone()),
            "networkLocation" => Value::Str(self.network_location.clone()),
            "networkSSID" => Value::Str(self.network_ssid.clone().unwrap_or_default()),
            "vpnConnected" => Value::Bool(self.vpn_connected),
            "timeOfDay" => Value::Str(self.time_of_day.clone()),
            "dayOfWeek" => Value::Str(self.day_of_week.clone()),
            "isWeekend" => Value::Bool(self.is_weekend),
            _ => Value::Str(self.custom.get(name)?.clone()),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Value {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty() && s != "false",
        }
    }

    fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self.as_num(), other.as_num()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => Some(self.as_str().cmp(&other.as_str())),
        }
    }

    fn equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Bool(a), b) | (b, Value::Bool(a)) => *a == b.truthy(),
            _ => match (self.as_num(), other.as_num()) {
                (Some(a), Some(b)) => a == b,
                _ => self.as_str() == other.as_str(),
            },
        }
    }

    fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(s) => s.parse().ok(),
            Value::Bool(_) => None,
        }
    }

    fn as_str(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Num(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LParen,
    RParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{}", s),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Num(n) => write!(f, "{}", n),
            other => write!(f, "{:?}", other),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                        None => return Err("unterminated string literal".into()),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err("expected '==' not '='".into());
                }
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '<' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '&' => {
                chars.next();
                chars.next_if_eq(&'&');
                tokens.push(Token::And);
            }
            '|' => {
                chars.next();
                chars.next_if_eq(&'|');
                tokens.push(Token::Or);
            }
            c if c.is_ascii_digit() => {
                let mut s = String::new();
                while let Some(ch) = chars.next_if(|ch| ch.is_ascii_digit() || *ch == '.') {
                    s.push(ch);
                }
                tokens.push(Token::Num(
                    s.parse().map_err(|_| format!("bad number '{}'", s))?,
                ));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut s = String::new();
                while let Some(ch) = chars.next_if(|ch| ch.is_ascii_alphanumeric() || *ch == '_') {
                    s.push(ch);
                }
                match s.to_ascii_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    "NOT" => tokens.push(Token::Not),
                    _ => tokens.push(Token::Ident(s)),
                }
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

#[derive(Clone, Debug)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp(Box<Expr>, Token, Box<Expr>),
    Call(String, Vec<Expr>),
    Var(String),
    Lit(Value),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(match self.peek() {
                Some(t) => format!("expected {} but found {}", token, t),
                None => format!("expected {} but input ended", token),
            })
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        while self.eat(&Token::And) {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Not) {
            Ok(Expr::Not(Box::new(self.parse_unary()?)))
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_primary()?;
        let op = match self.peek() {
            Some(t @ (Token::Eq | Token::Ne | Token::Lt | Token::Le | Token::Gt | Token::Ge)) => {
                t.clone()
            }
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_primary()?;
        Ok(Expr::Cmp(Box::new(left), op, Box::new(right)))
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::Str(s))),
            Some(Token::Num(n)) => Ok(Expr::Lit(Value::Num(n))),
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.parse_expr()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(Token::Comma)?;
                        }
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    match name.as_str() {
                        "true" => Ok(Expr::Lit(Value::Bool(true))),
                        "false" => Ok(Expr::Lit(Value::Bool(false))),
                        _ => Ok(Expr::Var(name)),
                    }
                }
            }
            Some(t) => Err(format!("unexpected token {}", t)),
            None => Err("unexpected end of predicate".into()),
        }
    }
}

fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err("empty predicate".into());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err("trailing tokens after expression".into());
    }
    Ok(expr)
}

// "HH:mm" -> minutes since midnight.
fn minutes(time: &str) -> Option<u32> {
    let (h, m) = time.split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

/// Numeric-aware dotted version comparison; `1.10` is newer than `1.9`.
pub fn version_compare(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|c| c.trim().parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let (x, y) = (a.get(i).unwrap_or(&0), b.get(i).unwrap_or(&0));
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn eval_call(name: &str, args: &[Value], ctx: &EvaluationContext) -> Result<Value, String> {
    let arity = |n: usize| -> Result<(), String> {
        if args.len() == n {
            Ok(())
        } else {
            Err(format!("{} expects {} argument(s)", name, n))
        }
    };
    Ok(match name {
        "isWeekend" => {
            arity(0)?;
            Value::Bool(ctx.is_weekend)
        }
        "isWeekday" => {
            arity(0)?;
            Value::Bool(!ctx.is_weekend)
        }
        "isUsingVPN" => {
            arity(0)?;
            Value::Bool(ctx.vpn_connected)
        }
        "isBusinessHours" => {
            arity(0)?;
            let now = minutes(&ctx.time_of_day).unwrap_or(0);
            Value::Bool(!ctx.is_weekend && (9 * 60..17 * 60).contains(&now))
        }
        "isOnNetwork" => {
            arity(1)?;
            Value::Bool(ctx.network_ssid.as_deref() == Some(args[0].as_str().as_str()))
        }
        "timeIsBetween" => {
            arity(2)?;
            let now = minutes(&ctx.time_of_day).ok_or("context time is not HH:mm")?;
            let start = minutes(&args[0].as_str()).ok_or("start is not HH:mm")?;
            let end = minutes(&args[1].as_str()).ok_or("end is not HH:mm")?;
            // Ranges crossing midnight wrap.
            Value::Bool(if start <= end {
                (start..end).contains(&now)
            } else {
                now >= start || now < end
            })
        }
        "versionCompare" => {
            arity(2)?;
            Value::Num(match version_compare(&args[0].as_str(), &args[1].as_str()) {
                Ordering::Less => -1.0,
                Ordering::Equal => 0.0,
                Ordering::Greater => 1.0,
            })
        }
        other => return Err(format!("unknown function '{}'", other)),
    })
}

fn eval(expr: &Expr, ctx: &EvaluationContext) -> Result<Value, String> {
    Ok(match expr {
        Expr::Or(a, b) => Value::Bool(eval(a, ctx)?.truthy() || eval(b, ctx)?.truthy()),
        Expr::And(a, b) => Value::Bool(eval(a, ctx)?.truthy() && eval(b, ctx)?.truthy()),
        Expr::Not(a) => Value::Bool(!eval(a, ctx)?.truthy()),
        Expr::Cmp(a, op, b) => {
            let (a, b) = (eval(a, ctx)?, eval(b, ctx)?);
            Value::Bool(match op {
                Token::Eq => a.equals(&b),
                Token::Ne => !a.equals(&b),
                Token::Lt => a.compare(&b) == Some(Ordering::Less),
                Token::Le => matches!(a.compare(&b), Some(Ordering::Less | Ordering::Equal)),
                Token::Gt => a.compare(&b) == Some(Ordering::Greater),
                Token::Ge => matches!(a.compare(&b), Some(Ordering::Greater | Ordering::Equal)),
                _ => unreachable!("parser only emits comparison operators here"),
            })
        }
        Expr::Call(name, args) => {
            let args: Result<Vec<Value>, String> = args.iter().map(|a| eval(a, ctx)).collect();
            eval_call(name, &args?, ctx)?
        }
        Expr::Var(name) => match ctx.lookup(name) {
            Some(v) => v,
            None => {
                warn!("predicate references unknown variable '{}'", name);
                Value::Bool(false)
            }
        },
        Expr::Lit(v) => v.clone(),
    })
}

/// Check the predicate parses, without evaluating it.
pub fn validate(predicate: &str) -> Result<(), String> {
    parse(predicate).map(|_| ())
}

/// Evaluate a predicate against a context. Unknown variables compare false;
/// syntax errors are reported.
pub fn evaluate(predicate: &str, ctx: &EvaluationContext) -> Result<bool, String> {
    let expr = parse(predicate)?;
    Ok(eval(&expr, ctx)?.truthy())
}

/// Variable names referenced by the predicate, for diagnostics.
pub fn variables(predicate: &str) -> Vec<String> {
    fn walk(expr: &Expr, out: &mut Vec<String>) {
        match expr {
            Expr::Or(a, b) | Expr::And(a, b) | Expr::Cmp(a, _, b) => {
                walk(a, out);
                walk(b, out);
            }
            Expr::Not(a) => walk(a, out),
            Expr::Call(_, args) => args.iter().for_each(|a| walk(a, out)),
            Expr::Var(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            Expr::Lit(_) => {}
        }
    }
    let mut out = Vec::new();
    if let Ok(expr) = parse(predicate) {
        walk(&expr, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn office_ctx() -> EvaluationContext {
        EvaluationContext {
            os_version: "14.2".into(),
            network_location: "office".into(),
            network_ssid: Some("corp-wifi".into()),
            vpn_connected: true,
            time_of_day: "10:30".into(),
            day_of_week: "Tuesday".into(),
            is_weekend: false,
            ..Default::default()
        }
    }

    #[test]
    fn comparisons_and_boolean_operators() {
        let ctx = office_ctx();
        assert!(evaluate("networkLocation == \"office\"", &ctx).unwrap());
        assert!(evaluate("networkLocation != 'home'", &ctx).unwrap());
        assert!(evaluate("vpnConnected == true", &ctx).unwrap());
        assert!(evaluate("vpnConnected AND networkLocation == 'office'", &ctx).unwrap());
        assert!(evaluate("networkLocation == 'home' OR isWeekday()", &ctx).unwrap());
        assert!(evaluate("NOT isWeekend", &ctx).unwrap());
        assert!(evaluate("(vpnConnected) && !(isWeekend)", &ctx).unwrap());
    }

    #[test]
    fn functions() {
        let ctx = office_ctx();
        assert!(evaluate("isBusinessHours()", &ctx).unwrap());
        assert!(evaluate("isOnNetwork('corp-wifi')", &ctx).unwrap());
        assert!(!evaluate("isOnNetwork('cafe')", &ctx).unwrap());
        assert!(evaluate("timeIsBetween('09:00', '17:00')", &ctx).unwrap());
        assert!(!evaluate("timeIsBetween('22:00', '06:00')", &ctx).unwrap());
        assert!(evaluate("versionCompare(osVersion, '14.0') >= 0", &ctx).unwrap());
        assert!(evaluate("versionCompare('1.9', '1.10') < 0", &ctx).unwrap());
    }

    #[test]
    fn numeric_string_comparison() {
        let mut ctx = office_ctx();
        ctx.set_custom("securityScore", "85");
        assert!(evaluate("securityScore > 70", &ctx).unwrap());
        assert!(!evaluate("securityScore > 90", &ctx).unwrap());
    }

    #[test]
    fn unknown_variables_compare_false() {
        let ctx = office_ctx();
        assert!(!evaluate("nonexistent == 'x'", &ctx).unwrap());
        assert!(evaluate("nonexistent == 'x' OR vpnConnected", &ctx).unwrap());
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(validate("(((").is_err());
        assert!(validate("a ==").is_err());
        assert!(validate("a = b").is_err());
        assert!(validate("").is_err());
        assert!(validate("unknownFn()").is_ok()); // parse-time OK...
        let ctx = office_ctx();
        assert!(evaluate("unknownFn()", &ctx).is_err()); // ...eval-time error
    }

    #[test]
    fn variable_extraction() {
        let vars = variables("vpnConnected AND versionCompare(osVersion, '1.0') > 0");
        assert_eq!(vars, vec!["vpnConnected", "osVersion"]);
    }

    #[test]
    fn weekend_context_refresh() {
        let mut ctx = EvaluationContext::default();
        let saturday = Local.with_ymd_and_hms(2024, 6, 1, 14, 30, 0).unwrap();
        ctx.refresh_time(saturday);
        assert_eq!(ctx.day_of_week, "Saturday");
        assert!(ctx.is_weekend);
        assert_eq!(ctx.time_of_day, "14:30");
    }
}
