//! Conversion of expression source text into the internal AST.
//!
//! Component expressions can be written as strings (`"a * x + b"`); this
//! module parses them with the `evalexpr` operator-tree parser and converts
//! the resulting nodes into [`Expr`]. Identifiers that match a declared
//! parameter become parameter symbols (carrying that parameter's metadata);
//! every other identifier becomes a plain variable.

use evalexpr::{build_operator_tree, Node, Operator};

use crate::errors::ParseError;
use crate::expr::Expr;
use crate::symbols::{Parameter, Symbol, Variable};

/// Parses an expression, classifying identifiers against `params`.
///
/// # Example
/// ```
/// use fitmodel::parse::parse_expr;
/// use fitmodel::symbols::Parameter;
///
/// let params = [Parameter::new("a"), Parameter::new("b")];
/// let expr = parse_expr("a * x + b", &params).unwrap();
/// assert_eq!(expr.free_symbols().len(), 3);
/// ```
pub fn parse_expr(source: &str, params: &[Parameter]) -> Result<Expr, ParseError> {
    let node = build_operator_tree(source)?;
    convert(&node, params)
}

fn symbol_for(identifier: &str, params: &[Parameter]) -> Symbol {
    match params.iter().find(|p| p.name() == identifier) {
        Some(p) => Symbol::Param(p.clone()),
        None => Symbol::Var(Variable::new(identifier)),
    }
}

fn convert(node: &Node, params: &[Parameter]) -> Result<Expr, ParseError> {
    match node.operator() {
        // n-ary additions and multiplications fold into binary chains
        Operator::Add => {
            let children = node.children();
            children
                .iter()
                .skip(1)
                .try_fold(convert(&children[0], params)?, |acc, child| {
                    Ok(acc + convert(child, params)?)
                })
        }
        Operator::Mul => {
            let children = node.children();
            children
                .iter()
                .skip(1)
                .try_fold(convert(&children[0], params)?, |acc, child| {
                    Ok(acc * convert(child, params)?)
                })
        }
        Operator::Sub => {
            let children = node.children();
            Ok(convert(&children[0], params)? - convert(&children[1], params)?)
        }
        Operator::Div => {
            let children = node.children();
            Ok(convert(&children[0], params)? / convert(&children[1], params)?)
        }
        Operator::Neg => {
            let children = node.children();
            Ok(-convert(&children[0], params)?)
        }
        Operator::Const { value } => match value {
            evalexpr::Value::Float(f) => Ok(Expr::Const(*f)),
            evalexpr::Value::Int(i) => Ok(Expr::Const(*i as f64)),
            other => Err(ParseError::NonNumericConstant(format!("{other:?}"))),
        },
        Operator::VariableIdentifierRead { identifier } => {
            Ok(Expr::Sym(symbol_for(identifier, params)))
        }
        // exponentiation keeps the strongest structure the exponent allows:
        // integer powers stay integer for the multiply-chain codegen
        Operator::Exp => {
            let children = node.children();
            let base = convert(&children[0], params)?;
            if let Operator::Const { value } = children[1].operator() {
                match value {
                    evalexpr::Value::Int(exp) => return Ok(base.pow(*exp)),
                    evalexpr::Value::Float(exp) => return Ok(base.powf(*exp)),
                    _ => {}
                }
            }
            Ok(base.pow_expr(convert(&children[1], params)?))
        }
        Operator::FunctionIdentifier { identifier } => {
            let children = node.children();
            let arg = match children.first() {
                Some(child) => convert(child, params)?,
                None => {
                    return Err(ParseError::WrongArity {
                        name: identifier.to_string(),
                        expected: 1,
                    })
                }
            };
            match identifier.as_str() {
                "abs" => Ok(arg.abs()),
                "exp" => Ok(arg.exp()),
                "ln" | "log" => Ok(arg.ln()),
                "sqrt" => Ok(arg.sqrt()),
                "sin" => Ok(arg.sin()),
                "cos" => Ok(arg.cos()),
                other => Err(ParseError::UnsupportedFunction(other.to_string())),
            }
        }
        Operator::RootNode => {
            let children = node.children();
            if children.len() == 1 {
                convert(&children[0], params)
            } else {
                Err(ParseError::RootNode(format!("{children:?}")))
            }
        }
        other => Err(ParseError::UnsupportedOperator(format!("{other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_classify_against_parameters() {
        let params = [Parameter::new("a")];
        let expr = parse_expr("a * x", &params).unwrap();
        let syms: Vec<Symbol> = expr.free_symbols().into_iter().collect();
        assert!(syms.iter().any(|s| s.name() == "a" && s.is_param()));
        assert!(syms.iter().any(|s| s.name() == "x" && !s.is_param()));
    }

    #[test]
    fn integer_exponents_stay_integer() {
        let expr = parse_expr("x^3", &[]).unwrap();
        assert!(matches!(expr, Expr::Pow(_, 3)));
    }

    #[test]
    fn functions_parse() {
        for src in ["exp(x)", "ln(x)", "sqrt(x)", "sin(x)", "cos(x)", "abs(x)"] {
            assert!(parse_expr(src, &[]).is_ok(), "{src}");
        }
        assert!(matches!(
            parse_expr("gamma(x)", &[]),
            Err(ParseError::UnsupportedFunction(_))
        ));
    }

    #[test]
    fn parsed_matches_programmatic() {
        let a = Parameter::new("a");
        let x = Variable::new("x");
        let parsed = parse_expr("a * x^2 + 1", &[a.clone()]).unwrap();
        let built = Expr::from(&a) * Expr::from(&x).pow(2) + 1.0;
        assert!(parsed.equivalent(&built));
    }
}
