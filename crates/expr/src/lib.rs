//! Mercury expression engine: the small filter and order-by languages the
//! query pipeline evaluates against stored objects.
//!
//! Filter: `` `$.ObjectMeta.Name` = 'myconn' ``, with `=  !=  <  <=  >  >=
//! LIKE`, boolean `AND`/`OR`/`NOT` and parentheses. Order-by: a comma
//! separated list of `` `$.path` [ASC|DESC] `` clauses, `ASC` by default.
//!
//! Literals are typed at parse time and never interpolated anywhere, so
//! hostile literal content is inert. A path that does not resolve on a
//! given object makes the enclosing comparison false rather than erroring;
//! heterogeneous kinds can therefore share one filter.

#![forbid(unsafe_code)]

use std::cmp::Ordering;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

mod lex;
mod value;

use lex::{tokenize, Token};
pub use value::{compare_values, Path};

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("unexpected character {ch:?} at offset {pos}")]
    Lex { ch: char, pos: usize },
    #[error("unterminated {what} at offset {pos}")]
    Unterminated { what: &'static str, pos: usize },
    #[error("path reference must look like `$.Field.Sub`: `{0}`")]
    BadPath(String),
    #[error("invalid numeric literal: {0}")]
    BadLiteral(String),
    #[error("unknown keyword: {0}")]
    UnknownKeyword(String),
    #[error("expected {expected}, found {found}")]
    Parse { expected: &'static str, found: String },
    #[error("trailing input after expression: {0}")]
    Trailing(String),
    #[error("LIKE pattern did not compile: {0}")]
    BadLikePattern(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl Literal {
    fn to_value(&self) -> Value {
        match self {
            Literal::Str(s) => Value::String(s.clone()),
            Literal::Int(n) => Value::from(*n),
            Literal::Float(f) => serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Null => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Path(Path),
    Literal(Literal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Compare { lhs: Operand, op: CompareOp, rhs: Operand },
    Like { lhs: Operand, pattern: Regex },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// A parsed filter predicate, evaluated per object.
#[derive(Debug, Clone)]
pub struct Filter {
    expr: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct OrderClause {
    pub path: Path,
    pub direction: Direction,
}

/// A parsed order-by clause list; earlier clauses dominate.
#[derive(Debug, Clone)]
pub struct OrderBy {
    clauses: Vec<OrderClause>,
}

impl Filter {
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(input)?;
        let mut p = Parser { tokens, pos: 0 };
        let expr = p.or_expr()?;
        p.expect_end()?;
        Ok(Self { expr })
    }

    /// Evaluate against one serialized object. Unresolvable paths and
    /// incomparable operand types make the comparison false.
    pub fn matches(&self, doc: &Value) -> bool {
        eval(&self.expr, doc)
    }
}

impl OrderBy {
    pub fn parse(input: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(input)?;
        let mut p = Parser { tokens, pos: 0 };
        let mut clauses = vec![p.order_clause()?];
        while p.eat(&Token::Comma) {
            clauses.push(p.order_clause()?);
        }
        p.expect_end()?;
        Ok(Self { clauses })
    }

    /// Compare two serialized objects. Objects whose key does not resolve
    /// sort after all resolvable ones regardless of direction; ties (and
    /// incomparable pairs) fall through to the next clause. Callers break
    /// remaining ties on the primary key to keep pagination stable.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for clause in &self.clauses {
            let ra = clause.path.resolve(a);
            let rb = clause.path.resolve(b);
            let ord = match (ra, rb) {
                (None, None) => Ordering::Equal,
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(x), Some(y)) => {
                    let ord = compare_values(x, y).unwrap_or(Ordering::Equal);
                    match clause.direction {
                        Direction::Asc => ord,
                        Direction::Desc => ord.reverse(),
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

// ---- Parsing ----

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

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Token, expected: &'static str) -> Result<(), ExprError> {
        match self.next() {
            Some(t) if t == tok => Ok(()),
            other => Err(parse_err(expected, other)),
        }
    }

    fn expect_end(&mut self) -> Result<(), ExprError> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(ExprError::Trailing(t.describe())),
        }
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary_expr()?;
        while self.eat(&Token::And) {
            let rhs = self.unary_expr()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary_expr(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary_expr()?)));
        }
        if self.eat(&Token::LParen) {
            let inner = self.or_expr()?;
            self.expect(Token::RParen, "closing parenthesis")?;
            return Ok(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.operand()?;
        match self.next() {
            Some(Token::Eq) => self.finish_compare(lhs, CompareOp::Eq),
            Some(Token::Ne) => self.finish_compare(lhs, CompareOp::Ne),
            Some(Token::Lt) => self.finish_compare(lhs, CompareOp::Lt),
            Some(Token::Le) => self.finish_compare(lhs, CompareOp::Le),
            Some(Token::Gt) => self.finish_compare(lhs, CompareOp::Gt),
            Some(Token::Ge) => self.finish_compare(lhs, CompareOp::Ge),
            Some(Token::Like) => {
                let pattern = match self.next() {
                    Some(Token::Str(s)) => like_regex(&s)?,
                    other => return Err(parse_err("string pattern after LIKE", other)),
                };
                Ok(Expr::Like { lhs, pattern })
            }
            other => Err(parse_err("comparison operator", other)),
        }
    }

    fn finish_compare(&mut self, lhs: Operand, op: CompareOp) -> Result<Expr, ExprError> {
        let rhs = self.operand()?;
        Ok(Expr::Compare { lhs, op, rhs })
    }

    fn operand(&mut self) -> Result<Operand, ExprError> {
        match self.next() {
            Some(Token::Path(segs)) => Ok(Operand::Path(Path(segs))),
            Some(Token::Str(s)) => Ok(Operand::Literal(Literal::Str(s))),
            Some(Token::Int(n)) => Ok(Operand::Literal(Literal::Int(n))),
            Some(Token::Float(f)) => Ok(Operand::Literal(Literal::Float(f))),
            Some(Token::True) => Ok(Operand::Literal(Literal::Bool(true))),
            Some(Token::False) => Ok(Operand::Literal(Literal::Bool(false))),
            Some(Token::Null) => Ok(Operand::Literal(Literal::Null)),
            other => Err(parse_err("path reference or literal", other)),
        }
    }

    fn order_clause(&mut self) -> Result<OrderClause, ExprError> {
        let path = match self.next() {
            Some(Token::Path(segs)) => Path(segs),
            other => return Err(parse_err("path reference", other)),
        };
        let direction = if self.eat(&Token::Desc) {
            Direction::Desc
        } else {
            // ASC is the default and may be spelled out.
            self.eat(&Token::Asc);
            Direction::Asc
        };
        Ok(OrderClause { path, direction })
    }
}

fn parse_err(expected: &'static str, found: Option<Token>) -> ExprError {
    ExprError::Parse {
        expected,
        found: found.map(|t| t.describe()).unwrap_or_else(|| "end of input".into()),
    }
}

/// Translate a LIKE pattern to an anchored regex: `%` matches any run,
/// `_` any single character, everything else literally.
fn like_regex(pattern: &str) -> Result<Regex, ExprError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| ExprError::BadLikePattern(e.to_string()))
}

// ---- Evaluation ----

fn eval(expr: &Expr, doc: &Value) -> bool {
    match expr {
        Expr::And(a, b) => eval(a, doc) && eval(b, doc),
        Expr::Or(a, b) => eval(a, doc) || eval(b, doc),
        Expr::Not(e) => !eval(e, doc),
        Expr::Like { lhs, pattern } => match resolve(lhs, doc) {
            Some(Value::String(s)) => pattern.is_match(&s),
            _ => false,
        },
        Expr::Compare { lhs, op, rhs } => eval_compare(lhs, *op, rhs, doc),
    }
}

fn resolve(operand: &Operand, doc: &Value) -> Option<Value> {
    match operand {
        Operand::Path(p) => p.resolve(doc).cloned(),
        Operand::Literal(l) => Some(l.to_value()),
    }
}

fn eval_compare(lhs: &Operand, op: CompareOp, rhs: &Operand, doc: &Value) -> bool {
    let lv = resolve(lhs, doc);
    let rv = resolve(rhs, doc);

    // NULL comparisons treat an unresolvable path as null, so `= NULL`
    // can select objects missing a field entirely.
    let l_null = matches!(lv, None | Some(Value::Null));
    let r_null = matches!(rv, None | Some(Value::Null));
    if l_null || r_null {
        return match op {
            CompareOp::Eq => l_null && r_null,
            CompareOp::Ne => l_null != r_null,
            _ => false,
        };
    }

    let (lv, rv) = match (lv, rv) {
        (Some(l), Some(r)) => (l, r),
        _ => return false,
    };
    match compare_values(&lv, &rv) {
        Some(ord) => match op {
            CompareOp::Eq => ord == Ordering::Equal,
            CompareOp::Ne => ord != Ordering::Equal,
            CompareOp::Lt => ord == Ordering::Less,
            CompareOp::Le => ord != Ordering::Greater,
            CompareOp::Gt => ord == Ordering::Greater,
            CompareOp::Ge => ord != Ordering::Less,
        },
        // Incomparable dynamic types: the comparison is false, never an error.
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(name: &str, role: &str) -> Value {
        json!({
            "Kind": "Link",
            "ObjectMeta": {"Name": name, "Namespace": "ns", "UID": name, "CreationTimestamp": "2020-01-01T00:00:00Z"},
            "Spec": {"Role": role, "Address": "orders"},
        })
    }

    #[test]
    fn equality_on_metadata_name() {
        let f = Filter::parse("`$.ObjectMeta.Name` = 'a'").unwrap();
        assert!(f.matches(&doc("a", "sender")));
        assert!(!f.matches(&doc("b", "sender")));
    }

    #[test]
    fn missing_path_is_false_not_error() {
        let f = Filter::parse("`$.Spec.Hostname` = 'h'").unwrap();
        assert!(!f.matches(&doc("a", "sender")));
        let ne = Filter::parse("`$.Spec.Hostname` != 'h'").unwrap();
        // Unresolvable path excludes the object for != as well.
        assert!(!ne.matches(&doc("a", "sender")));
    }

    #[test]
    fn null_literal_matches_missing_field() {
        let f = Filter::parse("`$.Spec.Hostname` = NULL").unwrap();
        assert!(f.matches(&doc("a", "sender")));
        let f = Filter::parse("`$.Spec.Role` != NULL").unwrap();
        assert!(f.matches(&doc("a", "sender")));
    }

    #[test]
    fn relational_operators_on_numbers() {
        let d = json!({"Spec": {"Count": 5}});
        assert!(Filter::parse("`$.Spec.Count` > 4").unwrap().matches(&d));
        assert!(Filter::parse("`$.Spec.Count` <= 5").unwrap().matches(&d));
        assert!(!Filter::parse("`$.Spec.Count` < 5").unwrap().matches(&d));
        // Type mismatch: number vs string compares false.
        assert!(!Filter::parse("`$.Spec.Count` > 'x'").unwrap().matches(&d));
    }

    #[test]
    fn boolean_combinators_and_parens() {
        let f = Filter::parse(
            "(`$.Spec.Role` = 'sender' OR `$.Spec.Role` = 'receiver') AND NOT `$.ObjectMeta.Name` = 'b'",
        )
        .unwrap();
        assert!(f.matches(&doc("a", "sender")));
        assert!(f.matches(&doc("a", "receiver")));
        assert!(!f.matches(&doc("b", "sender")));
        assert!(!f.matches(&doc("a", "router")));
    }

    #[test]
    fn like_wildcards() {
        let f = Filter::parse("`$.ObjectMeta.Name` LIKE 'host:%'").unwrap();
        assert!(f.matches(&doc("host:1234", "sender")));
        assert!(!f.matches(&doc("other", "sender")));

        let one = Filter::parse("`$.ObjectMeta.Name` LIKE 'host:123_'").unwrap();
        assert!(one.matches(&doc("host:1234", "sender")));
        assert!(!one.matches(&doc("host:12345", "sender")));

        // Regex metacharacters in the pattern are literal.
        let dotted = Filter::parse("`$.ObjectMeta.Name` LIKE 'a.b'").unwrap();
        assert!(dotted.matches(&doc("a.b", "sender")));
        assert!(!dotted.matches(&doc("axb", "sender")));
    }

    #[test]
    fn timestamps_compare_chronologically() {
        let f = Filter::parse("`$.ObjectMeta.CreationTimestamp` < '2021-01-01T00:00:00Z'").unwrap();
        assert!(f.matches(&doc("a", "sender")));
    }

    #[test]
    fn parse_failures_are_reported() {
        assert!(Filter::parse("`$.A` ~ 'x'").is_err());
        assert!(Filter::parse("`$.A` = ").is_err());
        assert!(Filter::parse("`$.A` = 'x' 'y'").is_err());
        assert!(Filter::parse("`$.A` IS NULL").is_err());
        assert!(OrderBy::parse("`$.A` SIDEWAYS").is_err());
    }

    #[test]
    fn injection_attempts_stay_literal() {
        let f = Filter::parse("`$.ObjectMeta.Name` = ''' OR 1=1'").unwrap();
        assert!(!f.matches(&doc("a", "sender")));
        assert!(f.matches(&doc("' OR 1=1", "sender")));
    }

    #[test]
    fn order_by_directions_and_ties() {
        let ob = OrderBy::parse("`$.Spec.Role`, `$.ObjectMeta.Name` DESC").unwrap();
        let a = doc("a", "sender");
        let b = doc("b", "sender");
        let c = doc("c", "receiver");
        // receiver < sender on the first clause.
        assert_eq!(ob.compare(&c, &a), Ordering::Less);
        // Same role: name DESC breaks the tie.
        assert_eq!(ob.compare(&a, &b), Ordering::Greater);
        assert_eq!(ob.compare(&a, &a), Ordering::Equal);
    }

    #[test]
    fn unresolvable_order_key_sorts_last() {
        let ob = OrderBy::parse("`$.Spec.Role` DESC").unwrap();
        let with = doc("a", "sender");
        let without = json!({"ObjectMeta": {"Name": "z"}});
        assert_eq!(ob.compare(&with, &without), Ordering::Less);
        assert_eq!(ob.compare(&without, &with), Ordering::Greater);
    }
}
