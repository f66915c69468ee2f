use std::collections::HashSet;
use std::sync::Arc;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit0, digit1, multispace0, satisfy},
    combinator::{all_consuming, cut, map, map_opt, not, opt, recognize, value},
    error::{context, ContextError, ErrorKind, ParseError},
    multi::{fold_many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};

use crate::xml::NodeId;

use super::{
    CompiledExpression, EvaluationScope, XPathEngine, XPathError, XPathResult, XPathValue,
};

/// XPath 1.0 subset: literals, `$variables`, location paths over element and
/// attribute names, comparisons, `and`/`or` and a handful of core functions.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleXPath;

impl XPathEngine for SimpleXPath {
    #[tracing::instrument(level = "debug", skip(self))]
    fn compile(&self, expression: &str) -> XPathResult<Arc<dyn CompiledExpression>> {
        if expression.trim().is_empty() {
            return Err(syntax(expression, 0, "empty expression"));
        }
        let expr = match all_consuming(or_expr)(expression) {
            Ok((_, expr)) => expr,
            Err(nom::Err::Error(e) | nom::Err::Failure(e)) => return Err(e.into_xpath(expression)),
            Err(nom::Err::Incomplete(_)) => {
                return Err(syntax(expression, expression.len(), "incomplete expression"))
            }
        };
        Ok(Arc::new(SimpleExpression {
            source: expression.to_string(),
            expr,
        }))
    }
}

#[derive(Debug)]
struct SimpleExpression {
    source: String,
    expr: Expr,
}

impl CompiledExpression for SimpleExpression {
    fn source(&self) -> &str {
        &self.source
    }

    fn evaluate(&self, scope: &EvaluationScope<'_>) -> XPathResult<XPathValue> {
        eval(&self.expr, scope)
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

fn syntax(expression: &str, offset: usize, message: &str) -> XPathError {
    XPathError::Syntax {
        expression: expression.to_string(),
        offset,
        message: message.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Or,
    And,
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Function {
    Not,
    True,
    False,
    String,
    Concat,
    Count,
    Boolean,
    Contains,
    StartsWith,
    NormalizeSpace,
}

impl Function {
    fn lookup(name: &str) -> Option<(Self, usize, usize)> {
        let entry = match name {
            "not" => (Function::Not, 1, 1),
            "true" => (Function::True, 0, 0),
            "false" => (Function::False, 0, 0),
            "string" => (Function::String, 0, 1),
            "concat" => (Function::Concat, 2, usize::MAX),
            "count" => (Function::Count, 1, 1),
            "boolean" => (Function::Boolean, 1, 1),
            "contains" => (Function::Contains, 2, 2),
            "starts-with" => (Function::StartsWith, 2, 2),
            "normalize-space" => (Function::NormalizeSpace, 0, 1),
            _ => return None,
        };
        Some(entry)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum NameTest {
    Any,
    Name(String),
}

impl NameTest {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameTest::Any => true,
            NameTest::Name(expected) => expected == name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    SelfNode,
    Parent,
    Child(NameTest),
    Descendant(NameTest),
    Attribute(NameTest),
}

#[derive(Debug, Clone, PartialEq)]
struct LocationPath {
    absolute: bool,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(String),
    Number(f64),
    Variable(String),
    Path(LocationPath),
    Call(Function, Vec<Expr>),
    Binary(Box<Expr>, Op, Box<Expr>),
}

/// Parser error carrying the unparsed remainder, so the offset can be
/// recovered from the full expression.
#[derive(Debug)]
enum ExprError<'a> {
    Syntax {
        at: &'a str,
        message: &'static str,
        context: Option<&'static str>,
    },
    Rejected(XPathError),
}

impl ExprError<'_> {
    fn into_xpath(self, expression: &str) -> XPathError {
        match self {
            ExprError::Syntax {
                at,
                message,
                context,
            } => syntax(
                expression,
                expression.len() - at.len(),
                context.unwrap_or(message),
            ),
            ExprError::Rejected(error) => error,
        }
    }
}

impl<'a> ParseError<&'a str> for ExprError<'a> {
    fn from_error_kind(input: &'a str, kind: ErrorKind) -> Self {
        let message = match kind {
            ErrorKind::Eof => "unexpected trailing input",
            _ => "expected an expression",
        };
        ExprError::Syntax {
            at: input,
            message,
            context: None,
        }
    }

    fn append(_: &'a str, _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl<'a> ContextError<&'a str> for ExprError<'a> {
    // The innermost context names the construct that failed.
    fn add_context(_: &'a str, label: &'static str, other: Self) -> Self {
        match other {
            ExprError::Syntax {
                at,
                message,
                context: None,
            } => ExprError::Syntax {
                at,
                message,
                context: Some(label),
            },
            other => other,
        }
    }
}

type ParserResult<'a, T> = IResult<&'a str, T, ExprError<'a>>;

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> ParserResult<'a, O>
where
    F: FnMut(&'a str) -> ParserResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> ParserResult<'a, &'a str> {
    terminated(tag(word), not(satisfy(is_name_char)))
}

fn rejected<'a, T>(error: XPathError) -> ParserResult<'a, T> {
    Err(nom::Err::Failure(ExprError::Rejected(error)))
}

fn or_expr(input: &str) -> ParserResult<'_, Expr> {
    let (input, first) = and_expr(input)?;
    fold_many0(
        preceded(ws(keyword("or")), and_expr),
        move || first.clone(),
        |lhs, rhs| Expr::Binary(Box::new(lhs), Op::Or, Box::new(rhs)),
    )(input)
}

fn and_expr(input: &str) -> ParserResult<'_, Expr> {
    let (input, first) = equality_expr(input)?;
    fold_many0(
        preceded(ws(keyword("and")), equality_expr),
        move || first.clone(),
        |lhs, rhs| Expr::Binary(Box::new(lhs), Op::And, Box::new(rhs)),
    )(input)
}

fn equality_expr(input: &str) -> ParserResult<'_, Expr> {
    let (input, first) = relational_expr(input)?;
    fold_many0(
        pair(
            ws(alt((value(Op::NotEq, tag("!=")), value(Op::Eq, char('='))))),
            relational_expr,
        ),
        move || first.clone(),
        |lhs, (op, rhs)| Expr::Binary(Box::new(lhs), op, Box::new(rhs)),
    )(input)
}

fn relational_expr(input: &str) -> ParserResult<'_, Expr> {
    let (input, first) = primary(input)?;
    fold_many0(
        pair(
            ws(alt((
                value(Op::Le, tag("<=")),
                value(Op::Lt, char('<')),
                value(Op::Ge, tag(">=")),
                value(Op::Gt, char('>')),
            ))),
            primary,
        ),
        move || first.clone(),
        |lhs, (op, rhs)| Expr::Binary(Box::new(lhs), op, Box::new(rhs)),
    )(input)
}

fn primary(input: &str) -> ParserResult<'_, Expr> {
    ws(alt((
        literal,
        number,
        variable,
        parenthesized,
        call,
        map(location_path, Expr::Path),
    )))(input)
}

fn literal(input: &str) -> ParserResult<'_, Expr> {
    map(
        alt((
            preceded(
                char('\''),
                cut(context(
                    "unterminated string literal",
                    terminated(take_while(|c: char| c != '\''), char('\'')),
                )),
            ),
            preceded(
                char('"'),
                cut(context(
                    "unterminated string literal",
                    terminated(take_while(|c: char| c != '"'), char('"')),
                )),
            ),
        )),
        |text: &str| Expr::Literal(text.to_string()),
    )(input)
}

fn number(input: &str) -> ParserResult<'_, Expr> {
    map_opt(
        alt((
            recognize(pair(digit1, opt(pair(char('.'), digit0)))),
            recognize(pair(char('.'), digit1)),
        )),
        |text: &str| text.parse::<f64>().ok().map(Expr::Number),
    )(input)
}

fn name(input: &str) -> ParserResult<'_, &str> {
    recognize(pair(satisfy(is_name_start), take_while(is_name_char)))(input)
}

fn variable(input: &str) -> ParserResult<'_, Expr> {
    map(
        preceded(char('$'), cut(context("missing variable name", name))),
        |name: &str| Expr::Variable(name.to_string()),
    )(input)
}

fn parenthesized(input: &str) -> ParserResult<'_, Expr> {
    delimited(char('('), or_expr, cut(context("expected ')'", char(')'))))(input)
}

fn call(input: &str) -> ParserResult<'_, Expr> {
    let (rest, (function, args)) = pair(
        name,
        delimited(
            ws(char('(')),
            separated_list0(ws(char(',')), or_expr),
            cut(context("expected ')' after function arguments", ws(char(')')))),
        ),
    )(input)?;
    let Some((resolved, min, max)) = Function::lookup(function) else {
        return rejected(XPathError::UnknownFunction(function.to_string()));
    };
    if args.len() < min || args.len() > max {
        return rejected(XPathError::Arity {
            name: function.to_string(),
            count: args.len(),
        });
    }
    Ok((rest, Expr::Call(resolved, args)))
}

fn location_path(input: &str) -> ParserResult<'_, LocationPath> {
    alt((
        map(preceded(tag("//"), descendant_steps), |steps| LocationPath {
            absolute: true,
            steps,
        }),
        map(preceded(char('/'), opt(child_steps)), |steps| LocationPath {
            absolute: true,
            steps: steps.unwrap_or_default(),
        }),
        map(child_steps, |steps| LocationPath {
            absolute: false,
            steps,
        }),
    ))(input)
}

fn child_steps(input: &str) -> ParserResult<'_, Vec<Step>> {
    steps(input, false)
}

fn descendant_steps(input: &str) -> ParserResult<'_, Vec<Step>> {
    steps(input, true)
}

/// Steps joined by `/` or `//`; an attribute step may only come last.
fn steps(input: &str, descendant: bool) -> ParserResult<'_, Vec<Step>> {
    let (input, first) = step(input, descendant)?;
    let (rest, steps) = fold_many0(
        next_step,
        move || vec![first.clone()],
        |mut acc, next| {
            acc.push(next);
            acc
        },
    )(input)?;
    if steps[..steps.len() - 1]
        .iter()
        .any(|step| matches!(step, Step::Attribute(_)))
    {
        return Err(nom::Err::Failure(ExprError::Syntax {
            at: input,
            message: "attribute step must be last",
            context: None,
        }));
    }
    Ok((rest, steps))
}

fn next_step(input: &str) -> ParserResult<'_, Step> {
    let (input, descendant) = alt((value(true, tag("//")), value(false, char('/'))))(input)?;
    step(input, descendant)
}

fn step(input: &str, descendant: bool) -> ParserResult<'_, Step> {
    if descendant {
        return map(name_test, Step::Descendant)(input);
    }
    alt((
        value(Step::Parent, tag("..")),
        value(Step::SelfNode, char('.')),
        map(
            preceded(char('@'), cut(context("expected a name test", name_test))),
            Step::Attribute,
        ),
        map(name_test, Step::Child),
    ))(input)
}

fn name_test(input: &str) -> ParserResult<'_, NameTest> {
    alt((
        value(NameTest::Any, char('*')),
        map(name, |name: &str| NameTest::Name(name.to_string())),
    ))(input)
}

fn push_unique(nodes: &mut Vec<NodeId>, seen: &mut HashSet<NodeId>, node: NodeId) {
    if seen.insert(node) {
        nodes.push(node);
    }
}

fn select(path: &LocationPath, scope: &EvaluationScope<'_>) -> Vec<String> {
    let document = scope.document;
    let mut nodes = vec![if path.absolute {
        document.root()
    } else {
        scope.node
    }];

    for step in &path.steps {
        let mut next = Vec::new();
        let mut seen = HashSet::new();
        match step {
            Step::SelfNode => continue,
            Step::Parent => {
                for node in &nodes {
                    if let Some(parent) = document.parent(*node) {
                        push_unique(&mut next, &mut seen, parent);
                    }
                }
            }
            Step::Child(test) => {
                for node in &nodes {
                    for child in document.children(*node) {
                        if test.matches(document.name(*child)) {
                            push_unique(&mut next, &mut seen, *child);
                        }
                    }
                }
            }
            Step::Descendant(test) => {
                for node in &nodes {
                    for descendant in document.descendants(*node) {
                        if test.matches(document.name(descendant)) {
                            push_unique(&mut next, &mut seen, descendant);
                        }
                    }
                }
            }
            Step::Attribute(test) => {
                return nodes
                    .iter()
                    .flat_map(|node| document.attributes(*node))
                    .filter(|(name, _)| test.matches(name))
                    .map(|(_, value)| value.to_string())
                    .collect();
            }
        }
        nodes = next;
    }

    nodes
        .into_iter()
        .map(|node| document.string_value(node))
        .collect()
}

fn either(lhs: &XPathValue, rhs: &XPathValue, test: fn(&XPathValue) -> bool) -> bool {
    test(lhs) || test(rhs)
}

fn compare_atomic(op: Op, lhs: &XPathValue, rhs: &XPathValue) -> bool {
    match op {
        Op::Eq | Op::NotEq => {
            let equal = if either(lhs, rhs, |v| matches!(v, XPathValue::Boolean(_))) {
                lhs.to_bool() == rhs.to_bool()
            } else if either(lhs, rhs, |v| matches!(v, XPathValue::Number(_))) {
                lhs.to_number() == rhs.to_number()
            } else {
                lhs.clone().into_string() == rhs.clone().into_string()
            };
            if op == Op::Eq {
                equal
            } else {
                !equal
            }
        }
        Op::Lt => lhs.to_number() < rhs.to_number(),
        Op::Le => lhs.to_number() <= rhs.to_number(),
        Op::Gt => lhs.to_number() > rhs.to_number(),
        Op::Ge => lhs.to_number() >= rhs.to_number(),
        Op::And | Op::Or => false,
    }
}

/// Node-set comparisons are existential over the members' string values.
fn compare(op: Op, lhs: &XPathValue, rhs: &XPathValue) -> bool {
    match (lhs, rhs) {
        (XPathValue::NodeSet(left), XPathValue::NodeSet(right)) => left.iter().any(|l| {
            right.iter().any(|r| {
                compare_atomic(
                    op,
                    &XPathValue::String(l.clone()),
                    &XPathValue::String(r.clone()),
                )
            })
        }),
        (XPathValue::NodeSet(set), XPathValue::Boolean(_)) => {
            compare_atomic(op, &XPathValue::Boolean(!set.is_empty()), rhs)
        }
        (XPathValue::Boolean(_), XPathValue::NodeSet(set)) => {
            compare_atomic(op, lhs, &XPathValue::Boolean(!set.is_empty()))
        }
        (XPathValue::NodeSet(set), other) => set
            .iter()
            .any(|member| compare_atomic(op, &XPathValue::String(member.clone()), other)),
        (other, XPathValue::NodeSet(set)) => set
            .iter()
            .any(|member| compare_atomic(op, other, &XPathValue::String(member.clone()))),
        _ => compare_atomic(op, lhs, rhs),
    }
}

fn eval(expr: &Expr, scope: &EvaluationScope<'_>) -> XPathResult<XPathValue> {
    match expr {
        Expr::Literal(text) => Ok(XPathValue::String(text.clone())),
        Expr::Number(number) => Ok(XPathValue::Number(*number)),
        Expr::Variable(name) => scope
            .variables
            .resolve(name)
            .map(XPathValue::String)
            .ok_or_else(|| XPathError::UndefinedVariable(name.clone())),
        Expr::Path(path) => Ok(XPathValue::NodeSet(select(path, scope))),
        Expr::Binary(lhs, Op::Or, rhs) => {
            Ok(XPathValue::Boolean(eval(lhs, scope)?.to_bool() || eval(rhs, scope)?.to_bool()))
        }
        Expr::Binary(lhs, Op::And, rhs) => {
            Ok(XPathValue::Boolean(eval(lhs, scope)?.to_bool() && eval(rhs, scope)?.to_bool()))
        }
        Expr::Binary(lhs, op, rhs) => {
            let left = eval(lhs, scope)?;
            let right = eval(rhs, scope)?;
            Ok(XPathValue::Boolean(compare(*op, &left, &right)))
        }
        Expr::Call(function, args) => call_function(*function, args, scope),
    }
}

fn string_arg(args: &[Expr], index: usize, scope: &EvaluationScope<'_>) -> XPathResult<String> {
    match args.get(index) {
        Some(arg) => Ok(eval(arg, scope)?.into_string()),
        None => Ok(scope.document.string_value(scope.node)),
    }
}

fn call_function(function: Function, args: &[Expr], scope: &EvaluationScope<'_>) -> XPathResult<XPathValue> {
    let value = match function {
        Function::True => XPathValue::Boolean(true),
        Function::False => XPathValue::Boolean(false),
        Function::Not => XPathValue::Boolean(!eval(&args[0], scope)?.to_bool()),
        Function::Boolean => XPathValue::Boolean(eval(&args[0], scope)?.to_bool()),
        Function::String => XPathValue::String(string_arg(args, 0, scope)?),
        Function::Concat => {
            let mut text = String::new();
            for arg in args {
                text.push_str(&eval(arg, scope)?.into_string());
            }
            XPathValue::String(text)
        }
        Function::Count => match eval(&args[0], scope)? {
            XPathValue::NodeSet(nodes) => XPathValue::Number(nodes.len() as f64),
            _ => {
                return Err(XPathError::Evaluation(
                    "count() requires a node-set argument".to_string(),
                ))
            }
        },
        Function::Contains => {
            let haystack = string_arg(args, 0, scope)?;
            XPathValue::Boolean(haystack.contains(&string_arg(args, 1, scope)?))
        }
        Function::StartsWith => {
            let haystack = string_arg(args, 0, scope)?;
            XPathValue::Boolean(haystack.starts_with(&string_arg(args, 1, scope)?))
        }
        Function::NormalizeSpace => XPathValue::String(
            string_arg(args, 0, scope)?
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" "),
        ),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xml::Document;
    use std::collections::HashMap;

    struct Vars(HashMap<String, String>);

    impl crate::xpath::VariableResolver for Vars {
        fn resolve(&self, name: &str) -> Option<String> {
            self.0.get(name).cloned()
        }
    }

    fn evaluate(xml: &str, expression: &str) -> XPathResult<XPathValue> {
        let document = Document::parse(xml).unwrap();
        let variables = Vars(HashMap::from([("user".to_string(), "alice".to_string())]));
        let compiled = SimpleXPath.compile(expression)?;
        let scope = EvaluationScope {
            document: &document,
            node: document.root(),
            variables: &variables,
        };
        compiled.evaluate(&scope)
    }

    const REQUEST: &str =
        r#"<Req><User role="admin">alice</User><Item>1</Item><Item>5</Item><Deep><Item>9</Item></Deep></Req>"#;

    #[test]
    fn test_paths_and_comparisons() {
        assert!(evaluate(REQUEST, "Req/User = 'alice'").unwrap().to_bool());
        assert!(evaluate(REQUEST, "Req/User/@role != 'user'").unwrap().to_bool());
        assert!(evaluate(REQUEST, "Req/Item = 5").unwrap().to_bool());
        assert!(evaluate(REQUEST, "Req/Item > 4 and Req/Item < 2").unwrap().to_bool());
        assert!(!evaluate(REQUEST, "Req/Missing").unwrap().to_bool());
        assert!(evaluate(REQUEST, "/Req/User/../Item").unwrap().to_bool());
    }

    #[test]
    fn test_functions_and_variables() {
        assert_eq!(
            evaluate(REQUEST, "concat($user, '-', Req/User/@role)")
                .unwrap()
                .into_string(),
            "alice-admin"
        );
        assert_eq!(evaluate(REQUEST, "count(//Item)").unwrap(), XPathValue::Number(3.0));
        assert_eq!(evaluate(REQUEST, "count(Req/*)").unwrap(), XPathValue::Number(4.0));
        assert!(evaluate(REQUEST, "not(false()) or true()").unwrap().to_bool());
        assert!(evaluate(REQUEST, "starts-with(Req/User, 'ali')").unwrap().to_bool());
        assert_eq!(
            evaluate(REQUEST, "normalize-space('  a   b ')")
                .unwrap()
                .into_string(),
            "a b"
        );
    }

    #[test]
    fn test_compile_errors() {
        assert!(matches!(
            SimpleXPath.compile("Req/User = "),
            Err(XPathError::Syntax { .. })
        ));
        assert!(matches!(
            SimpleXPath.compile("'unterminated"),
            Err(XPathError::Syntax { .. })
        ));
        assert!(matches!(
            SimpleXPath.compile("lower-case('A')"),
            Err(XPathError::UnknownFunction(_))
        ));
        assert!(matches!(
            SimpleXPath.compile("not()"),
            Err(XPathError::Arity { .. })
        ));
        assert!(SimpleXPath.compile("").is_err());
    }

    #[test]
    fn test_undefined_variable_fails_at_evaluation() {
        assert_eq!(
            evaluate(REQUEST, "$missing = 'x'"),
            Err(XPathError::UndefinedVariable("missing".to_string()))
        );
    }

    #[test]
    fn test_syntax_errors_report_offsets() {
        let failure = |expression: &str| match SimpleXPath.compile(expression) {
            Err(XPathError::Syntax {
                offset, message, ..
            }) => (offset, message),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("'{}' compiled", expression),
        };
        assert_eq!(failure("Req/User = "), (9, "unexpected trailing input".to_string()));
        assert_eq!(failure("'open"), (5, "unterminated string literal".to_string()));
        assert_eq!(failure("Req/@a/b"), (3, "attribute step must be last".to_string()));
        assert_eq!(
            failure("concat('a', 'b'"),
            (15, "expected ')' after function arguments".to_string())
        );
    }

    #[test]
    fn test_whitespace_between_tokens() {
        assert!(evaluate(REQUEST, " count ( Req/Item ) = 2 ").unwrap().to_bool());
        assert!(evaluate(REQUEST, "(Req/User='alice')and(Req/Item>=5)").unwrap().to_bool());
    }
}
