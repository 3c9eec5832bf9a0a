//! Constant-expression evaluation for `#if`/`#elif` lines.
//!
//! By the time an expression reaches this module, `defined` operators have
//! been replaced by `1`/`0` and macros have been expanded, so the grammar is
//! integers, character constants, leftover identifiers (which evaluate to 0),
//! and the C operator set at its usual precedence. Division and modulo by
//! zero evaluate to 0 rather than failing the build.

use chumsky::error::Rich;
use chumsky::prelude::*;

fn escape_value(c: char) -> i64 {
    match c {
        'n' => 10,
        't' => 9,
        'r' => 13,
        'a' => 7,
        'b' => 8,
        'f' => 12,
        'v' => 11,
        '0' => 0,
        _ => c as i64,
    }
}

fn expr_parser<'a>() -> impl Parser<'a, &'a str, i64, extra::Err<Rich<'a, char>>> {
    recursive(|expr| {
        let hex = just("0x")
            .or(just("0X"))
            .ignore_then(text::digits(16).to_slice())
            .map(|s: &str| i64::from_str_radix(s, 16).unwrap_or(0));
        let dec = text::digits(10).to_slice().map(|s: &str| {
            if s.len() > 1 && s.starts_with('0') {
                i64::from_str_radix(&s[1..], 8).unwrap_or(0)
            } else {
                s.parse().unwrap_or(0)
            }
        });
        let number = hex.or(dec).then_ignore(one_of("uUlL").repeated());

        let chr = just('\'')
            .ignore_then(choice((
                just('\\').ignore_then(any()).map(escape_value),
                none_of("'").map(|c: char| c as i64),
            )))
            .then_ignore(just('\''));

        // Identifiers that survive macro expansion evaluate to 0.
        let ident = text::ident().to(0i64);

        let atom = choice((
            number,
            chr,
            ident,
            expr.clone().delimited_by(just('('), just(')')),
        ))
        .padded()
        .boxed();

        let unary = recursive(|unary| {
            choice((
                just('!')
                    .padded()
                    .ignore_then(unary.clone())
                    .map(|v: i64| (v == 0) as i64),
                just('~').padded().ignore_then(unary.clone()).map(|v: i64| !v),
                just('-')
                    .padded()
                    .ignore_then(unary.clone())
                    .map(i64::wrapping_neg),
                just('+').padded().ignore_then(unary.clone()),
                atom,
            ))
        })
        .boxed();

        let product = unary
            .clone()
            .foldl(
                one_of("*/%").padded().then(unary).repeated(),
                |a, (op, b): (char, i64)| match op {
                    '*' => a.wrapping_mul(b),
                    '/' => {
                        if b == 0 {
                            0
                        } else {
                            a.wrapping_div(b)
                        }
                    }
                    _ => {
                        if b == 0 {
                            0
                        } else {
                            a.wrapping_rem(b)
                        }
                    }
                },
            )
            .boxed();

        let sum = product
            .clone()
            .foldl(
                one_of("+-").padded().then(product).repeated(),
                |a, (op, b): (char, i64)| {
                    if op == '+' {
                        a.wrapping_add(b)
                    } else {
                        a.wrapping_sub(b)
                    }
                },
            )
            .boxed();

        let shift = sum
            .clone()
            .foldl(
                just("<<")
                    .to('l')
                    .or(just(">>").to('r'))
                    .padded()
                    .then(sum)
                    .repeated(),
                |a, (op, b): (char, i64)| {
                    let amount = (b & 63) as u32;
                    if op == 'l' {
                        a.wrapping_shl(amount)
                    } else {
                        a.wrapping_shr(amount)
                    }
                },
            )
            .boxed();

        let comparison = shift
            .clone()
            .foldl(
                choice((
                    just("<=").to('l'),
                    just(">=").to('g'),
                    just('<').to('<'),
                    just('>').to('>'),
                ))
                .padded()
                .then(shift)
                .repeated(),
                |a, (op, b): (char, i64)| {
                    let v = match op {
                        'l' => a <= b,
                        'g' => a >= b,
                        '<' => a < b,
                        _ => a > b,
                    };
                    v as i64
                },
            )
            .boxed();

        let equality = comparison
            .clone()
            .foldl(
                just("==")
                    .to(true)
                    .or(just("!=").to(false))
                    .padded()
                    .then(comparison)
                    .repeated(),
                |a, (eq, b): (bool, i64)| ((a == b) == eq) as i64,
            )
            .boxed();

        let bit_and = equality
            .clone()
            .foldl(
                just('&').padded().then(equality).repeated(),
                |a, (_, b): (char, i64)| a & b,
            )
            .boxed();

        let bit_xor = bit_and
            .clone()
            .foldl(
                just('^').padded().then(bit_and).repeated(),
                |a, (_, b): (char, i64)| a ^ b,
            )
            .boxed();

        let bit_or = bit_xor
            .clone()
            .foldl(
                just('|').padded().then(bit_xor).repeated(),
                |a, (_, b): (char, i64)| a | b,
            )
            .boxed();

        let logic_and = bit_or
            .clone()
            .foldl(
                just("&&").padded().then(bit_or).repeated(),
                |a, (_, b): (&str, i64)| (a != 0 && b != 0) as i64,
            )
            .boxed();

        let logic_or = logic_and
            .clone()
            .foldl(
                just("||").padded().then(logic_and).repeated(),
                |a, (_, b): (&str, i64)| (a != 0 || b != 0) as i64,
            )
            .boxed();

        recursive(|ternary| {
            logic_or
                .then(
                    just('?')
                        .padded()
                        .ignore_then(expr.clone())
                        .then_ignore(just(':').padded())
                        .then(ternary)
                        .or_not(),
                )
                .map(|(c, rest): (i64, Option<(i64, i64)>)| match rest {
                    Some((t, e)) => {
                        if c != 0 {
                            t
                        } else {
                            e
                        }
                    }
                    None => c,
                })
        })
    })
}

/// Evaluate a conditional-inclusion expression. Unparseable input evaluates
/// to 0, matching the tolerance of the rest of the preprocessor.
pub fn eval(src: &str) -> i64 {
    expr_parser()
        .then_ignore(end())
        .parse(src.trim())
        .into_result()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::eval;
    use rstest::rstest;

    #[rstest]
    #[case("1", 1)]
    #[case("0", 0)]
    #[case("1 + 2 * 3", 7)]
    #[case("(1 + 2) * 3", 9)]
    #[case("10 / 3", 3)]
    #[case("10 % 3", 1)]
    #[case("1 / 0", 0)]
    #[case("7 % 0", 0)]
    #[case("1 << 4", 16)]
    #[case("256 >> 4", 16)]
    #[case("1 < 2", 1)]
    #[case("2 <= 1", 0)]
    #[case("3 == 3", 1)]
    #[case("3 != 3", 0)]
    #[case("0xff & 0x0f", 15)]
    #[case("1 | 2", 3)]
    #[case("5 ^ 1", 4)]
    #[case("1 && 0", 0)]
    #[case("1 || 0", 1)]
    #[case("!0", 1)]
    #[case("!5", 0)]
    #[case("~0", -1)]
    #[case("-3 + 5", 2)]
    #[case("+4", 4)]
    #[case("1 ? 10 : 20", 10)]
    #[case("0 ? 10 : 20", 20)]
    #[case("0x10", 16)]
    #[case("010", 8)]
    #[case("199901L", 199901)]
    #[case("42u", 42)]
    #[case("'A'", 65)]
    #[case("'\\n'", 10)]
    fn evaluates_c_operators(#[case] src: &str, #[case] expected: i64) {
        assert_eq!(eval(src), expected, "expression: {}", src);
    }

    #[test]
    fn unknown_identifiers_are_zero() {
        assert_eq!(eval("SOME_UNDEFINED_MACRO"), 0);
        assert_eq!(eval("FOO || 1"), 1);
        assert_eq!(eval("FOO && 1"), 0);
    }

    #[test]
    fn garbage_is_zero() {
        assert_eq!(eval(""), 0);
        assert_eq!(eval("@@@"), 0);
    }

    #[test]
    fn precedence_matches_c() {
        assert_eq!(eval("1 | 2 & 3"), 3); // & binds tighter than |
        assert_eq!(eval("1 + 2 << 1"), 6); // shift below additive
        assert_eq!(eval("1 == 1 && 2 == 2"), 1);
    }
}
