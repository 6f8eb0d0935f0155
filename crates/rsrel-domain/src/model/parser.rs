//! Schema compiler.
//!
//! Parses the schema DSL into a [`CompiledSchema`], recording the source
//! position of every definition so later validation errors can point back at
//! the text.
//!
//! Example schema:
//! ```text
//! type user
//!
//! type document
//!   relations
//!     define owner: [user]
//!     define banned: [user]
//!     define viewer: [user, user:*, user with on_network] or owner
//!     define can_view: viewer but not banned
//!
//! condition on_network(allowed: string, ip: string) {
//!   ip == allowed
//! }
//! ```
//!
//! Operator precedence (highest to lowest): `but not`, `and`, `or`.
//! Parentheses group explicitly.

use std::collections::HashSet;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace1, satisfy, space0, space1},
    combinator::{cut, map, not, opt, recognize, value},
    error::{context, ContextError, ParseError, VerboseError, VerboseErrorKind},
    multi::{many0, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult, Offset,
};
use thiserror::Error;

use super::schema::{
    CaveatDefinition, CaveatParameter, CompiledSchema, NamespaceDefinition, RelationDefinition,
    SourcePosition, TypeConstraint, Userset,
};

/// Schema compilation failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompileError {
    /// The schema text is malformed or reuses a definition name.
    #[error("{message}")]
    Syntax {
        message: String,
        position: Option<SourcePosition>,
        /// Source text near the failure.
        context: Option<String>,
    },

    /// Compilation failed for a reason unrelated to the schema text.
    #[error("schema compilation failed: {message}")]
    Internal { message: String },
}

/// Result type for compiler operations.
pub type CompileResult<T> = Result<T, CompileError>;

const RESERVED_KEYWORDS: &[&str] = &[
    "type",
    "relations",
    "define",
    "condition",
    "or",
    "and",
    "but",
    "not",
    "from",
    "this",
    "with",
];

const SNIPPET_LEN: usize = 40;

// ============ Helper Parsers ============

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Parse a comment (# to end of line)
fn comment<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, (), E> {
    value((), pair(char('#'), take_while(|c| c != '\n' && c != '\r')))(input)
}

/// Parse whitespace including comments
fn ws<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, (), E> {
    value((), many0(alt((value((), multispace1), comment))))(input)
}

/// Match a keyword that is not immediately followed by an identifier character.
fn keyword<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    kw: &'static str,
) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str, E> {
    terminated(tag(kw), not(satisfy(is_ident_char)))
}

fn starts_with_keyword(input: &str, kw: &str) -> bool {
    input.starts_with(kw)
        && !input[kw.len()..]
            .chars()
            .next()
            .is_some_and(is_ident_char)
}

/// Parse an identifier (lowercase alphanumeric and underscore, not a reserved keyword)
fn identifier<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, &'a str, E> {
    let (rest, id) = recognize(pair(
        satisfy(|c| c.is_ascii_lowercase()),
        take_while(is_ident_char),
    ))(input)?;

    if RESERVED_KEYWORDS.contains(&id) {
        return Err(nom::Err::Error(E::from_error_kind(
            input,
            nom::error::ErrorKind::Tag,
        )));
    }

    Ok((rest, id))
}

/// Parse a namespace name, optionally prefixed (`tenant/document`)
fn namespace_name<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, &'a str, E> {
    context(
        "namespace name",
        recognize(pair(identifier, opt(pair(char('/'), identifier)))),
    )(input)
}

fn position_of(source: &str, slice: &str) -> SourcePosition {
    SourcePosition::from_offset(source, source.offset(slice))
}

fn snippet(input: &str) -> String {
    let line = input.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        "end of input".to_string()
    } else {
        line.chars().take(SNIPPET_LEN).collect()
    }
}

// ============ Type Constraint Parsers ============

/// Parse one allowed subject type: `user`, `user:*`, `group#member`, `user with cond`
fn type_constraint<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, TypeConstraint, E> {
    context(
        "type constraint",
        map(
            tuple((
                namespace_name,
                opt(tag(":*")),
                opt(preceded(char('#'), identifier)),
                opt(preceded(tuple((space1, keyword("with"), space1)), identifier)),
            )),
            |(namespace, wildcard, relation, caveat): (
                &str,
                Option<&str>,
                Option<&str>,
                Option<&str>,
            )| {
                TypeConstraint {
                    namespace: namespace.to_string(),
                    relation: relation.map(str::to_string),
                    wildcard: wildcard.is_some(),
                    caveat: caveat.map(str::to_string),
                }
            },
        ),
    )(input)
}

/// Parse a type constraint list like [user] or [user, group#member]
fn type_constraint_list<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Vec<TypeConstraint>, E> {
    context(
        "type constraint list",
        preceded(
            char('['),
            cut(terminated(
                delimited(
                    space0,
                    separated_list1(tuple((space0, char(','), space0)), type_constraint),
                    space0,
                ),
                char(']'),
            )),
        ),
    )(input)
}

// ============ Userset Parsers ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Union,
    Intersection,
    Exclusion,
}

/// Parse "relation from tupleset" (tuple to userset)
fn tuple_to_userset<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Userset, E> {
    context(
        "tuple to userset",
        map(
            tuple((identifier, space1, keyword("from"), space1, cut(identifier))),
            |(computed, _, _, _, tupleset): (&str, _, _, _, &str)| Userset::TupleToUserset {
                tupleset: tupleset.to_string(),
                computed_userset: computed.to_string(),
            },
        ),
    )(input)
}

/// Parse a relation reference on the same object
fn computed_userset<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Userset, E> {
    map(identifier, |name: &str| Userset::ComputedUserset {
        relation: name.to_string(),
    })(input)
}

/// Parse a single operand of a rewrite expression
fn operand<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Userset, E> {
    context(
        "rewrite operand",
        alt((
            delimited(
                pair(char('('), space0),
                cut(rewrite_expression),
                cut(pair(space0, char(')'))),
            ),
            value(Userset::This, keyword("this")),
            tuple_to_userset,
            computed_userset,
        )),
    )(input)
}

fn operator<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Operator, E> {
    delimited(
        space1,
        alt((
            value(Operator::Union, keyword("or")),
            value(Operator::Intersection, keyword("and")),
            value(
                Operator::Exclusion,
                recognize(tuple((keyword("but"), space1, keyword("not")))),
            ),
        )),
        space1,
    )(input)
}

/// Parse `operand (operator operand)*` and apply precedence
fn rewrite_expression<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, Userset, E> {
    let (rest, first) = operand(input)?;
    let (rest, tail) = many0(pair(operator, cut(operand)))(rest)?;
    Ok((rest, fold_operators(first, tail)))
}

/// Builds the rewrite tree: exclusion binds tightest (left associative), then
/// intersection, then union.
fn fold_operators(first: Userset, tail: Vec<(Operator, Userset)>) -> Userset {
    let mut union_groups: Vec<Vec<Userset>> = vec![vec![first]];

    for (op, operand) in tail {
        match op {
            Operator::Union => union_groups.push(vec![operand]),
            Operator::Intersection => {
                if let Some(group) = union_groups.last_mut() {
                    group.push(operand);
                }
            }
            Operator::Exclusion => {
                if let Some(group) = union_groups.last_mut() {
                    if let Some(base) = group.pop() {
                        group.push(Userset::Exclusion {
                            base: Box::new(base),
                            subtract: Box::new(operand),
                        });
                    }
                }
            }
        }
    }

    let mut unions: Vec<Userset> = union_groups
        .into_iter()
        .map(|mut group| {
            if group.len() == 1 {
                group.remove(0)
            } else {
                Userset::Intersection { children: group }
            }
        })
        .collect();

    if unions.len() == 1 {
        unions.remove(0)
    } else {
        Userset::Union { children: unions }
    }
}

// ============ Definition Parsers ============

/// Parse a relation definition like "define viewer: [user] or editor"
fn relation_definition<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    source: &'a str,
) -> impl FnMut(&'a str) -> IResult<&'a str, RelationDefinition, E> {
    move |input: &'a str| {
        let position = position_of(source, input);
        let (rest, (_, _, name, _, _, _)) = context(
            "relation definition",
            tuple((
                keyword("define"),
                space1,
                cut(identifier),
                space0,
                cut(char(':')),
                space0,
            )),
        )(input)?;

        let (rest, constraints) = opt(type_constraint_list)(rest)?;
        let (rest, rewrite) = match constraints {
            Some(_) => {
                let (rest, tail) = many0(pair(operator, cut(operand)))(rest)?;
                (rest, fold_operators(Userset::This, tail))
            }
            None => context("relation rewrite", cut(rewrite_expression))(rest)?,
        };

        Ok((
            rest,
            RelationDefinition {
                name: name.to_string(),
                type_constraints: constraints.unwrap_or_default(),
                rewrite,
                position: Some(position),
            },
        ))
    }
}

/// Parse a type definition with optional relations
fn type_definition<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    source: &'a str,
) -> impl FnMut(&'a str) -> IResult<&'a str, NamespaceDefinition, E> {
    move |input: &'a str| {
        let position = position_of(source, input);
        let (rest, (_, _, name)) = context(
            "type definition",
            tuple((keyword("type"), space1, cut(namespace_name))),
        )(input)?;
        let (rest, _) = ws(rest)?;

        let mut relations = Vec::new();
        let mut rest = rest;
        if starts_with_keyword(rest, "relations") {
            let (next, _) = terminated(keyword("relations"), ws)(rest)?;
            rest = next;
            while starts_with_keyword(rest, "define") {
                let (next, relation) = cut(relation_definition(source))(rest)?;
                let (next, _) = ws(next)?;
                relations.push(relation);
                rest = next;
            }
        }

        Ok((
            rest,
            NamespaceDefinition {
                name: name.to_string(),
                relations,
                position: Some(position),
            },
        ))
    }
}

/// Parse a parameter type like `string` or `list<map<int>>`
fn parameter_type<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, &'a str, E> {
    recognize(pair(
        take_while1(is_ident_char),
        opt(delimited(char('<'), parameter_type, char('>'))),
    ))(input)
}

fn condition_parameter<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, CaveatParameter, E> {
    context(
        "condition parameter",
        map(
            tuple((identifier, space0, char(':'), space0, cut(parameter_type))),
            |(name, _, _, _, type_name): (&str, _, _, _, &str)| {
                CaveatParameter::new(name, type_name)
            },
        ),
    )(input)
}

/// Consume up to the `}` matching an already consumed `{`, skipping string literals.
fn balanced_body<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    input: &'a str,
) -> IResult<&'a str, &'a str, E> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in input.char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == open {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' => depth += 1,
            '}' if depth == 0 => return Ok((&input[i + 1..], &input[..i])),
            '}' => depth -= 1,
            _ => {}
        }
    }

    Err(nom::Err::Error(E::from_char(input, '}')))
}

/// Parse `condition name(params) { expression }`
fn condition_definition<'a, E: ParseError<&'a str> + ContextError<&'a str>>(
    source: &'a str,
) -> impl FnMut(&'a str) -> IResult<&'a str, CaveatDefinition, E> {
    move |input: &'a str| {
        let position = position_of(source, input);
        let (rest, (_, _, name, _, parameters, _)) = context(
            "condition definition",
            tuple((
                keyword("condition"),
                space1,
                cut(identifier),
                space0,
                cut(delimited(
                    pair(char('('), ws),
                    separated_list0(tuple((ws, char(','), ws)), condition_parameter),
                    pair(ws, char(')')),
                )),
                ws,
            )),
        )(input)?;
        let (rest, body) = context(
            "condition body",
            preceded(cut(char('{')), cut(balanced_body)),
        )(rest)?;

        let expression = body.trim();
        let leading = body.len() - body.trim_start().len();

        Ok((
            rest,
            CaveatDefinition {
                name: name.to_string(),
                parameters,
                expression: expression.to_string(),
                position: Some(position),
                expression_position: Some(position_of(source, &body[leading..])),
            },
        ))
    }
}

// ============ Schema Parser ============

fn parse_schema<'a>(source: &'a str) -> Result<CompiledSchema, CompileError> {
    let mut schema = CompiledSchema::default();
    let mut rest = source;

    loop {
        let (next, _) = ws::<VerboseError<&str>>(rest).map_err(|e| convert(source, e))?;
        rest = next;
        if rest.is_empty() {
            break;
        }

        if starts_with_keyword(rest, "type") {
            let (next, namespace) = type_definition::<VerboseError<&str>>(source)(rest)
                .map_err(|e| convert(source, e))?;
            schema.namespaces.push(namespace);
            rest = next;
        } else if starts_with_keyword(rest, "condition") {
            let (next, caveat) = condition_definition::<VerboseError<&str>>(source)(rest)
                .map_err(|e| convert(source, e))?;
            schema.caveats.push(caveat);
            rest = next;
        } else {
            return Err(CompileError::Syntax {
                message: format!(
                    "expected `type` or `condition` definition, found `{}`",
                    snippet(rest)
                ),
                position: Some(position_of(source, rest)),
                context: Some(snippet(rest)),
            });
        }
    }

    Ok(schema)
}

fn convert(source: &str, err: nom::Err<VerboseError<&str>>) -> CompileError {
    let error = match err {
        nom::Err::Error(e) | nom::Err::Failure(e) => e,
        nom::Err::Incomplete(_) => {
            return CompileError::Internal {
                message: "incomplete input".to_string(),
            }
        }
    };

    let Some((failed_at, _)) = error.errors.first() else {
        return CompileError::Internal {
            message: "parser reported an empty error".to_string(),
        };
    };

    let while_parsing = error
        .errors
        .iter()
        .find_map(|(_, kind)| match kind {
            VerboseErrorKind::Context(ctx) => Some(*ctx),
            _ => None,
        })
        .unwrap_or("schema");
    let expected = error.errors.iter().find_map(|(_, kind)| match kind {
        VerboseErrorKind::Char(c) => Some(format!("expected `{c}`, ")),
        _ => None,
    });

    CompileError::Syntax {
        message: format!(
            "parse error in {while_parsing}: {}found `{}`",
            expected.unwrap_or_default(),
            snippet(failed_at)
        ),
        position: Some(position_of(source, failed_at)),
        context: Some(snippet(failed_at)),
    }
}

/// Rejects definition names used more than once, across types and conditions.
fn check_unique_names(schema: &CompiledSchema) -> CompileResult<()> {
    let mut seen = HashSet::new();
    let definitions = schema
        .namespaces
        .iter()
        .map(|ns| (&ns.name, ns.position))
        .chain(schema.caveats.iter().map(|c| (&c.name, c.position)));

    for (name, position) in definitions {
        if !seen.insert(name.as_str()) {
            return Err(CompileError::Syntax {
                message: format!("found name reused between multiple definitions: `{name}`"),
                position,
                context: Some(name.clone()),
            });
        }
    }
    Ok(())
}

// ============ Public API ============

/// Compiles schema text into namespace and caveat definitions.
///
/// # Example
///
/// ```ignore
/// let schema = compile(r#"
/// type user
///
/// type document
///   relations
///     define owner: [user]
///     define viewer: [user] or owner
/// "#)?;
/// assert_eq!(schema.namespaces.len(), 2);
/// ```
pub fn compile(source: &str) -> CompileResult<CompiledSchema> {
    let schema = parse_schema(source)?;
    check_unique_names(&schema)?;
    Ok(schema)
}
