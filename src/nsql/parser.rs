//! nsQL recursive-descent parser
//!
//! Grammar and semantic rules are enforced while the tree is built: the first
//! violation aborts the parse and no partial tree is returned.
//!
//! Operator precedence, loosest first:
//! `or`, `and`, `not`, comparison, `+ - & |`, `* / %`, unary sign, primary.

use super::ast::*;
use super::lexer::{tokenize, Keyword, Symbol, Token};
use crate::error::NsqlError;

type PResult<T> = Result<T, NsqlError>;

/// Parse one `;`-terminated statement
pub fn parse(text: &str) -> PResult<Statement> {
    if text.trim().is_empty() {
        return Err(NsqlError::syntax("empty query"));
    }

    let mut parser = Parser {
        tokens: tokenize(text),
        pos: 0,
        aggregate_scope: Vec::new(),
    };
    let statement = parser.statement()?;
    parser.expect_symbol(Symbol::Semicolon)?;
    if parser.peek().is_some() {
        return Err(parser.unexpected());
    }
    Ok(statement)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Aggregators currently being parsed, innermost last
    aggregate_scope: Vec<FunctionName>,
}

fn syntax(msg: impl Into<String>) -> NsqlError {
    NsqlError::syntax(msg)
}

impl Parser {
    // Token plumbing

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn peek_name(&self) -> &'static str {
        self.peek().map(Token::name).unwrap_or("$end")
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn unexpected(&self) -> NsqlError {
        syntax(format!("unexpected {}", self.peek_name()))
    }

    fn at_keyword(&self, kw: Keyword) -> bool {
        self.peek().map(|t| t.is_keyword(kw)).unwrap_or(false)
    }

    fn at_symbol(&self, sym: Symbol) -> bool {
        self.peek().map(|t| t.is_symbol(sym)).unwrap_or(false)
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_symbol(&mut self, sym: Symbol) -> bool {
        if self.at_symbol(sym) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> PResult<()> {
        if self.eat_keyword(kw) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn expect_symbol(&mut self, sym: Symbol) -> PResult<()> {
        if self.eat_symbol(sym) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn expect_identifier(&mut self) -> PResult<String> {
        match self.peek() {
            Some(Token::Identifier(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn alias(&mut self) -> PResult<Option<String>> {
        if self.eat_keyword(Keyword::As) {
            Ok(Some(self.expect_identifier()?))
        } else {
            Ok(None)
        }
    }

    /// `name` or `owner.name`
    fn qualified_name(&mut self) -> PResult<Identifier> {
        let first = self.expect_identifier()?;
        if self.eat_symbol(Symbol::Period) {
            let second = self.expect_identifier()?;
            Ok(Identifier {
                owner: Some(first),
                name: second,
            })
        } else {
            Ok(Identifier {
                owner: None,
                name: first,
            })
        }
    }

    fn table_name(&mut self) -> PResult<Identifier> {
        match self.peek() {
            Some(Token::Identifier(_)) => self.qualified_name(),
            _ => Err(syntax("table expected")),
        }
    }

    // Statements

    fn statement(&mut self) -> PResult<Statement> {
        match self.peek() {
            Some(Token::Keyword(Keyword::Select)) | Some(Token::Symbol(Symbol::LeftParen)) => {
                Ok(Statement::Query(self.query()?))
            }
            Some(Token::Keyword(Keyword::Insert)) => self.insert(),
            Some(Token::Keyword(Keyword::Update)) => self.update(),
            Some(Token::Keyword(Keyword::Delete)) => self.delete(),
            Some(Token::Keyword(Keyword::Create)) => self.create_table(),
            Some(Token::Keyword(Keyword::Drop)) => self.drop_table(),
            _ => Err(self.unexpected()),
        }
    }

    /// A select, or parenthesised selects joined by set operators
    fn query(&mut self) -> PResult<Query> {
        if !self.at_symbol(Symbol::LeftParen) {
            return Ok(Query::Select(Box::new(self.select()?)));
        }

        let mut query = Query::Select(Box::new(self.parenthesised_select()?));
        let mut combined = false;
        while let Some(op) = self.set_operator()? {
            let right = self.parenthesised_select()?;
            query = Query::Compound {
                op,
                left: Box::new(query),
                right: Box::new(Query::Select(Box::new(right))),
            };
            combined = true;
        }
        if !combined {
            return Err(self.unexpected());
        }
        Ok(query)
    }

    fn parenthesised_select(&mut self) -> PResult<Select> {
        self.expect_symbol(Symbol::LeftParen)?;
        if !self.at_keyword(Keyword::Select) {
            return Err(self.unexpected());
        }
        let select = self.select()?;
        self.expect_symbol(Symbol::RightParen)?;
        Ok(select)
    }

    fn set_operator(&mut self) -> PResult<Option<SetOperator>> {
        if self.eat_keyword(Keyword::Union) {
            if self.eat_keyword(Keyword::All) {
                return Ok(Some(SetOperator::UnionAll));
            }
            return Ok(Some(SetOperator::Union));
        }
        if self.eat_keyword(Keyword::Intersect) {
            return Ok(Some(SetOperator::Intersect));
        }
        Ok(None)
    }

    fn select(&mut self) -> PResult<Select> {
        self.expect_keyword(Keyword::Select)?;
        let distinct = if self.eat_keyword(Keyword::Distinct) {
            true
        } else {
            self.eat_keyword(Keyword::All);
            false
        };

        let items = self.select_items()?;
        self.expect_keyword(Keyword::From)?;
        let from = self.table_ref()?;
        let joins = self.joins()?;

        let mut references = vec![from.reference()];
        for join in &joins {
            let reference = join.table.reference();
            if references.contains(&reference) {
                return Err(syntax("duplicate reference"));
            }
            references.push(reference);
        }

        let where_clause = if self.eat_keyword(Keyword::Where) {
            Some(self.condition_clause()?)
        } else {
            None
        };

        let group_by = if self.eat_keyword(Keyword::Group) {
            self.expect_keyword(Keyword::By)?;
            Some(self.group_by()?)
        } else {
            None
        };

        let mut order_by = Vec::new();
        if self.eat_keyword(Keyword::Order) {
            self.expect_keyword(Keyword::By)?;
            loop {
                let expr = self.additive()?;
                let descending = if self.eat_keyword(Keyword::Desc) {
                    true
                } else {
                    self.eat_keyword(Keyword::Asc);
                    false
                };
                order_by.push(OrderItem { expr, descending });
                if !self.eat_symbol(Symbol::Comma) {
                    break;
                }
            }
        }

        let limit = if self.eat_keyword(Keyword::Limit) {
            match self.peek() {
                Some(Token::Integer(n)) => {
                    let n = n.parse::<u64>().map_err(|_| self.unexpected())?;
                    self.pos += 1;
                    Some(n)
                }
                _ => return Err(self.unexpected()),
            }
        } else {
            None
        };

        let select = Select {
            distinct,
            items,
            from,
            joins,
            where_clause,
            group_by,
            order_by,
            limit,
        };
        check_select(&select)?;
        Ok(select)
    }

    fn select_items(&mut self) -> PResult<Vec<SelectItem>> {
        if self.eat_symbol(Symbol::Asterisk) {
            return Ok(vec![SelectItem::Wildcard]);
        }

        if let Some(Token::Keyword(kw)) = self.peek() {
            if matches!(kw, Keyword::TCount | Keyword::TCorr | Keyword::TCov) {
                let expr = self.table_aggregator()?;
                return Ok(vec![SelectItem::Expr { expr, alias: None }]);
            }
        }

        let mut items = Vec::new();
        loop {
            let expr = self.condition()?;
            if expr.category == Category::Condition {
                return Err(syntax(format!("unexpected {}", expr)));
            }
            let alias = self.alias()?;
            items.push(SelectItem::Expr { expr, alias });
            if !self.eat_symbol(Symbol::Comma) {
                break;
            }
        }
        Ok(items)
    }

    fn table_aggregator(&mut self) -> PResult<Expr> {
        let name = match self.advance() {
            Some(Token::Keyword(Keyword::TCount)) => FunctionName::TCount,
            Some(Token::Keyword(Keyword::TCorr)) => FunctionName::TCorr,
            Some(Token::Keyword(Keyword::TCov)) => FunctionName::TCov,
            _ => return Err(syntax("unexpected table aggregator")),
        };
        self.expect_symbol(Symbol::LeftParen)?;
        let mut params = Vec::new();
        if name != FunctionName::TCount {
            params.push(self.identifier_param()?);
            self.expect_symbol(Symbol::Comma)?;
            params.push(self.identifier_param()?);
        }
        self.expect_symbol(Symbol::RightParen)?;
        Ok(Expr {
            kind: ExprKind::Function { name, params },
            category: Category::Numeric,
            expr_type: ExprType::Aggregate,
        })
    }

    fn table_ref(&mut self) -> PResult<TableRef> {
        if self.eat_symbol(Symbol::LeftParen) {
            if !self.at_keyword(Keyword::Select) {
                return Err(syntax(format!("unexpected {}", self.peek_name())));
            }
            let select = self.select()?;
            self.expect_symbol(Symbol::RightParen)?;
            if !self.at_keyword(Keyword::As) {
                return Err(syntax("AS expected"));
            }
            let alias = self.alias()?;
            return Ok(TableRef {
                source: TableSource::Subquery(Box::new(Query::Select(Box::new(select)))),
                alias,
            });
        }

        let table = self.qualified_name()?;
        if self.at_symbol(Symbol::Comma) {
            return Err(self.unexpected());
        }
        let alias = self.alias()?;
        Ok(TableRef {
            source: TableSource::Table(table),
            alias,
        })
    }

    fn joins(&mut self) -> PResult<Vec<Join>> {
        let mut joins = Vec::new();
        loop {
            let kind = match self.peek() {
                Some(Token::Keyword(Keyword::Join)) => JoinKind::Inner,
                Some(Token::Keyword(Keyword::Inner)) => {
                    self.pos += 1;
                    JoinKind::Inner
                }
                Some(Token::Keyword(Keyword::Left)) => {
                    self.pos += 1;
                    if self.eat_keyword(Keyword::Semi) {
                        JoinKind::LeftSemi
                    } else {
                        self.eat_keyword(Keyword::Outer);
                        JoinKind::LeftOuter
                    }
                }
                Some(Token::Keyword(Keyword::Right)) => {
                    self.pos += 1;
                    self.eat_keyword(Keyword::Outer);
                    JoinKind::RightOuter
                }
                Some(Token::Keyword(Keyword::Full)) => {
                    self.pos += 1;
                    self.eat_keyword(Keyword::Outer);
                    JoinKind::FullOuter
                }
                Some(Token::Keyword(Keyword::Outer)) => {
                    self.pos += 1;
                    JoinKind::FullOuter
                }
                _ => return Ok(joins),
            };
            self.expect_keyword(Keyword::Join)?;
            let table = self.table_ref()?;
            let on = if self.eat_keyword(Keyword::On) {
                Some(self.condition_clause()?)
            } else {
                None
            };
            joins.push(Join { kind, table, on });
        }
    }

    fn group_by(&mut self) -> PResult<GroupBy> {
        let mut items = Vec::new();
        loop {
            if self.at_symbol(Symbol::Asterisk) {
                return Err(self.unexpected());
            }
            let expr = self.additive()?;
            let alias = self.alias()?;
            if alias.is_none() && expr.as_identifier().is_none() {
                return Err(syntax("AS expected"));
            }
            items.push(SelectItem::Expr { expr, alias });
            if !self.eat_symbol(Symbol::Comma) {
                break;
            }
        }
        let having = if self.eat_keyword(Keyword::Having) {
            Some(self.condition_clause()?)
        } else {
            None
        };
        Ok(GroupBy { items, having })
    }

    fn insert(&mut self) -> PResult<Statement> {
        self.expect_keyword(Keyword::Insert)?;
        self.expect_keyword(Keyword::Into)?;
        let table = self.table_name()?;

        self.expect_symbol(Symbol::LeftParen)?;
        let mut columns = Vec::new();
        loop {
            columns.push(self.qualified_name()?);
            if !self.eat_symbol(Symbol::Comma) {
                break;
            }
        }
        self.expect_symbol(Symbol::RightParen)?;

        self.expect_keyword(Keyword::Values)?;
        self.expect_symbol(Symbol::LeftParen)?;
        let mut values = Vec::new();
        loop {
            let value = self.condition()?;
            if value.has_subquery() {
                return Err(syntax("unexpected subquery"));
            }
            values.push(value);
            if !self.eat_symbol(Symbol::Comma) {
                break;
            }
        }
        self.expect_symbol(Symbol::RightParen)?;

        if columns.len() != values.len() {
            return Err(syntax("unexpected number of values"));
        }
        Ok(Statement::Insert(Insert {
            table,
            columns,
            values,
        }))
    }

    fn update(&mut self) -> PResult<Statement> {
        self.expect_keyword(Keyword::Update)?;
        let table = self.table_name()?;
        self.expect_keyword(Keyword::Set)?;

        let mut assignments = Vec::new();
        loop {
            let column = self.qualified_name()?;
            self.expect_symbol(Symbol::Equal)?;
            let value = self.additive()?;
            if value.has_subquery() {
                return Err(syntax("unexpected subquery"));
            }
            assignments.push(Assignment { column, value });
            if !self.eat_symbol(Symbol::Comma) {
                break;
            }
        }

        let where_clause = if self.eat_keyword(Keyword::Where) {
            Some(self.condition_clause()?)
        } else {
            None
        };
        Ok(Statement::Update(Update {
            table,
            assignments,
            where_clause,
        }))
    }

    fn delete(&mut self) -> PResult<Statement> {
        self.expect_keyword(Keyword::Delete)?;
        self.expect_keyword(Keyword::From)?;
        let table = self.table_name()?;
        let where_clause = if self.eat_keyword(Keyword::Where) {
            let cond = self.condition_clause()?;
            if cond.has_subquery() {
                return Err(syntax("unexpected subquery"));
            }
            Some(cond)
        } else {
            None
        };
        Ok(Statement::Delete(Delete {
            table,
            where_clause,
        }))
    }

    fn create_table(&mut self) -> PResult<Statement> {
        self.expect_keyword(Keyword::Create)?;
        self.expect_keyword(Keyword::Table)?;
        let if_not_exists = if self.eat_keyword(Keyword::If) {
            self.expect_keyword(Keyword::Not)?;
            self.expect_keyword(Keyword::Exists)?;
            true
        } else {
            false
        };
        let table = self.table_name()?;

        self.expect_symbol(Symbol::LeftParen)?;
        let mut fields = Vec::new();
        let primary_key = loop {
            if self.eat_keyword(Keyword::Primary) {
                if fields.is_empty() {
                    return Err(syntax("unexpected PRIMARY"));
                }
                self.expect_keyword(Keyword::Key)?;
                break self.primary_key()?;
            }
            let name = self.expect_identifier()?;
            let field_type = self.field_type()?;
            fields.push(FieldDescription { name, field_type });
            self.expect_symbol(Symbol::Comma)?;
        };
        self.expect_symbol(Symbol::RightParen)?;

        let mut clustering_order = Vec::new();
        let mut compact_storage = false;
        if self.eat_keyword(Keyword::With) {
            loop {
                if self.eat_keyword(Keyword::Clustering) {
                    self.expect_keyword(Keyword::Order)?;
                    self.expect_keyword(Keyword::By)?;
                    self.expect_symbol(Symbol::LeftParen)?;
                    loop {
                        let column = self.expect_identifier()?;
                        let descending = if self.eat_keyword(Keyword::Desc) {
                            true
                        } else {
                            self.eat_keyword(Keyword::Asc);
                            false
                        };
                        clustering_order.push(ClusteringOrder { column, descending });
                        if !self.eat_symbol(Symbol::Comma) {
                            break;
                        }
                    }
                    self.expect_symbol(Symbol::RightParen)?;
                } else if self.eat_keyword(Keyword::Compact) {
                    self.expect_keyword(Keyword::Storage)?;
                    compact_storage = true;
                } else {
                    return Err(self.unexpected());
                }
                if !self.eat_keyword(Keyword::And) {
                    break;
                }
            }
        }

        Ok(Statement::CreateTable(CreateTable {
            if_not_exists,
            table,
            fields,
            primary_key,
            clustering_order,
            compact_storage,
        }))
    }

    fn primary_key(&mut self) -> PResult<PrimaryKey> {
        self.expect_symbol(Symbol::LeftParen)?;
        let partitioning = if self.eat_symbol(Symbol::LeftParen) {
            let columns = self.identifier_list()?;
            self.expect_symbol(Symbol::RightParen)?;
            columns
        } else {
            vec![self.expect_identifier()?]
        };
        let mut clustering = Vec::new();
        while self.eat_symbol(Symbol::Comma) {
            clustering.push(self.expect_identifier()?);
        }
        self.expect_symbol(Symbol::RightParen)?;
        Ok(PrimaryKey {
            partitioning,
            clustering,
        })
    }

    fn identifier_list(&mut self) -> PResult<Vec<String>> {
        let mut names = vec![self.expect_identifier()?];
        while self.eat_symbol(Symbol::Comma) {
            names.push(self.expect_identifier()?);
        }
        Ok(names)
    }

    fn field_type(&mut self) -> PResult<FieldType> {
        let simple = match self.peek() {
            Some(Token::Keyword(kw)) => kw.type_name().map(str::to_string),
            Some(Token::Identifier(name)) => Some(name.to_lowercase()),
            _ => None,
        };
        if let Some(name) = simple {
            self.pos += 1;
            return Ok(FieldType::Simple(name));
        }

        match self.peek() {
            Some(Token::Keyword(Keyword::Set))
            | Some(Token::Keyword(Keyword::List))
            | Some(Token::Keyword(Keyword::Map)) => {}
            _ => return Err(self.unexpected()),
        }
        match self.advance() {
            Some(Token::Keyword(Keyword::Set)) => {
                self.expect_symbol(Symbol::LessThan)?;
                let inner = self.field_type()?;
                self.expect_symbol(Symbol::GreaterThan)?;
                Ok(FieldType::Set(Box::new(inner)))
            }
            Some(Token::Keyword(Keyword::List)) => {
                self.expect_symbol(Symbol::LessThan)?;
                let inner = self.field_type()?;
                self.expect_symbol(Symbol::GreaterThan)?;
                Ok(FieldType::List(Box::new(inner)))
            }
            Some(Token::Keyword(Keyword::Map)) => {
                self.expect_symbol(Symbol::LessThan)?;
                let key = self.field_type()?;
                self.expect_symbol(Symbol::Comma)?;
                let value = self.field_type()?;
                self.expect_symbol(Symbol::GreaterThan)?;
                Ok(FieldType::Map(Box::new(key), Box::new(value)))
            }
            _ => Err(syntax("unexpected field type")),
        }
    }

    fn drop_table(&mut self) -> PResult<Statement> {
        self.expect_keyword(Keyword::Drop)?;
        self.expect_keyword(Keyword::Table)?;
        let if_exists = if self.eat_keyword(Keyword::If) {
            self.expect_keyword(Keyword::Exists)?;
            true
        } else {
            false
        };
        let table = self.table_name()?;
        Ok(Statement::DropTable(DropTable { if_exists, table }))
    }

    // Expressions

    /// A boolean condition as required after WHERE, ON and HAVING
    fn condition_clause(&mut self) -> PResult<Expr> {
        let cond = self.condition()?;
        if cond.category != Category::Condition {
            return Err(self.unexpected());
        }
        Ok(cond)
    }

    fn condition(&mut self) -> PResult<Expr> {
        let mut left = self.and_expr()?;
        while self.eat_keyword(Keyword::Or) {
            let right = self.and_expr()?;
            left = self.logical(BinaryOp::Or, left, right)?;
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let mut left = self.not_expr()?;
        while self.eat_keyword(Keyword::And) {
            let right = self.not_expr()?;
            left = self.logical(BinaryOp::And, left, right)?;
        }
        Ok(left)
    }

    fn logical(&self, op: BinaryOp, left: Expr, right: Expr) -> PResult<Expr> {
        if left.category != Category::Condition || right.category != Category::Condition {
            return Err(syntax(format!("unexpected {}", op.symbol().to_uppercase())));
        }
        let expr_type = infer_type(&left, &right)?;
        Ok(Expr {
            kind: ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            },
            category: Category::Condition,
            expr_type,
        })
    }

    fn not_expr(&mut self) -> PResult<Expr> {
        if self.eat_keyword(Keyword::Not) {
            let inner = self.not_expr()?;
            return negate(inner);
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let left = self.additive()?;

        let op = match self.peek() {
            Some(Token::Symbol(Symbol::Equal)) => Some(BinaryOp::Eq),
            Some(Token::Symbol(Symbol::NotEqual)) => Some(BinaryOp::Ne),
            Some(Token::Symbol(Symbol::LessThan)) => Some(BinaryOp::Lt),
            Some(Token::Symbol(Symbol::LessEqual)) => Some(BinaryOp::Le),
            Some(Token::Symbol(Symbol::GreaterThan)) => Some(BinaryOp::Gt),
            Some(Token::Symbol(Symbol::GreaterEqual)) => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            let op_name = self.peek_name();
            self.pos += 1;
            let right = self.additive()?;
            return compare(op, op_name, left, right);
        }

        if self.at_keyword(Keyword::Is) {
            if left.category != Category::Column {
                return Err(self.unexpected());
            }
            if left.as_identifier().is_none() {
                return Err(syntax("IDENTIFIER expected"));
            }
            self.pos += 1;
            let negated = self.eat_keyword(Keyword::Not);
            self.expect_keyword_token(Token::Null)?;
            return Ok(Expr {
                kind: ExprKind::IsNull {
                    negated,
                    expr: Box::new(left),
                },
                category: Category::Condition,
                expr_type: ExprType::Column,
            });
        }

        let negated_in = self.at_keyword(Keyword::Not)
            && self
                .peek_at(1)
                .map(|t| t.is_keyword(Keyword::In))
                .unwrap_or(false);
        if self.at_keyword(Keyword::In) || negated_in {
            if left.category != Category::Column {
                return Err(syntax("unexpected IN"));
            }
            let name = match left.as_identifier() {
                Some(id) => id.name.clone(),
                None => return Err(syntax("IDENTIFIER expected")),
            };
            if negated_in {
                self.pos += 1;
            }
            self.pos += 1;
            self.expect_symbol(Symbol::LeftParen)?;
            if !self.at_keyword(Keyword::Select) && !self.at_symbol(Symbol::LeftParen) {
                return Err(syntax("IDENTIFIER expected"));
            }
            let query = self.query()?;
            self.expect_symbol(Symbol::RightParen)?;

            let select = match query.as_select() {
                Some(select) => select,
                None => return Err(syntax("IDENTIFIER expected")),
            };
            let matches = select.items.len() == 1
                && select.group_by.is_none()
                && select.items[0].expr().is_some()
                && select.items[0].reference() == name;
            if !matches {
                return Err(syntax("unexpected column mismatch after IN"));
            }
            return Ok(Expr {
                kind: ExprKind::In {
                    negated: negated_in,
                    expr: Box::new(left),
                    query: Box::new(query),
                },
                category: Category::Condition,
                expr_type: ExprType::Column,
            });
        }

        Ok(left)
    }

    fn expect_keyword_token(&mut self, token: Token) -> PResult<()> {
        if self.peek() == Some(&token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    fn additive(&mut self) -> PResult<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Symbol(Symbol::Plus)) => BinaryOp::Add,
                Some(Token::Symbol(Symbol::Minus)) => BinaryOp::Sub,
                Some(Token::Symbol(Symbol::Ampersand)) => BinaryOp::BitAnd,
                Some(Token::Symbol(Symbol::VerticalBar)) => BinaryOp::BitOr,
                _ => return Ok(left),
            };
            let op_name = self.peek_name();
            self.pos += 1;
            let right_start = self.peek_name();
            let right = self.multiplicative()?;
            left = arithmetic(op, op_name, right_start, left, right)?;
        }
    }

    fn multiplicative(&mut self) -> PResult<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Symbol(Symbol::Asterisk)) => BinaryOp::Mul,
                Some(Token::Symbol(Symbol::Slash)) => BinaryOp::Div,
                Some(Token::Symbol(Symbol::Percent)) => BinaryOp::Mod,
                _ => return Ok(left),
            };
            let op_name = self.peek_name();
            self.pos += 1;
            let right_start = self.peek_name();
            let right = self.unary()?;
            left = arithmetic(op, op_name, right_start, left, right)?;
        }
    }

    fn unary(&mut self) -> PResult<Expr> {
        if self.eat_symbol(Symbol::Minus) {
            let operand = self.unary()?;
            let folded = match operand.as_literal() {
                Some(Literal::Integer(n)) => Some(Literal::Integer(flip_sign(n))),
                Some(Literal::Float(n)) => Some(Literal::Float(flip_sign(n))),
                Some(Literal::Interval { negative, text }) => Some(Literal::Interval {
                    negative: !negative,
                    text: text.clone(),
                }),
                _ => None,
            };
            if let Some(lit) = folded {
                return Ok(Expr::literal(lit));
            }
            return match operand.category {
                Category::Column | Category::Numeric => {
                    let category = operand.category;
                    let expr_type = operand.expr_type;
                    Ok(Expr {
                        kind: ExprKind::Negate(Box::new(operand)),
                        category,
                        expr_type,
                    })
                }
                _ => Err(syntax("unexpected MINUS_SIGN")),
            };
        }
        if self.eat_symbol(Symbol::Plus) {
            let operand = self.unary()?;
            return match operand.category {
                Category::Column | Category::Numeric | Category::Interval => Ok(operand),
                _ => Err(syntax("unexpected PLUS_SIGN")),
            };
        }
        self.primary()
    }

    fn primary(&mut self) -> PResult<Expr> {
        let token = match self.peek() {
            Some(t) => t.clone(),
            None => return Err(self.unexpected()),
        };

        let literal = match &token {
            Token::Integer(n) => Some(Literal::Integer(n.clone())),
            Token::Float(n) => Some(Literal::Float(n.clone())),
            Token::String(s) => Some(Literal::String(s.clone())),
            Token::Uuid(s) => Some(Literal::Uuid(s.clone())),
            Token::Timestamp(s) => Some(Literal::Timestamp(s.clone())),
            Token::Date(s) => Some(Literal::Date(s.clone())),
            Token::Time(s) => Some(Literal::Time(s.clone())),
            Token::Interval(s) => Some(Literal::Interval {
                negative: false,
                text: s.clone(),
            }),
            Token::Binary(b) => Some(Literal::Binary(b.clone())),
            Token::Boolean(b) => Some(Literal::Boolean(*b)),
            Token::Null => Some(Literal::Null),
            Token::Collection(c) => Some(Literal::Collection(c.clone())),
            _ => None,
        };
        if let Some(lit) = literal {
            self.pos += 1;
            return Ok(Expr::literal(lit));
        }

        match token {
            Token::Identifier(_) => Ok(Expr::identifier(self.qualified_name()?)),
            Token::Symbol(Symbol::LeftParen) => {
                self.pos += 1;
                if self.at_keyword(Keyword::Select) {
                    return Err(self.unexpected());
                }
                let inner = self.condition()?;
                self.expect_symbol(Symbol::RightParen)?;
                Ok(inner)
            }
            Token::Keyword(kw) => match function_name(kw) {
                Some(name) if name.family() != Family::TableAggregator => self.function(name),
                _ => Err(self.unexpected()),
            },
            _ => Err(self.unexpected()),
        }
    }

    fn function(&mut self, name: FunctionName) -> PResult<Expr> {
        self.pos += 1;
        self.expect_symbol(Symbol::LeftParen)?;

        match name.family() {
            Family::ColumnAggregator | Family::NumericAggregator => {
                if let Some(outer) = self.aggregate_scope.last() {
                    return Err(syntax(format!(
                        "unexpected aggregation function in {}",
                        outer.name()
                    )));
                }
                self.aggregate_scope.push(name);
                let params = self.generic_params(name);
                self.aggregate_scope.pop();
                let params = params?;
                let category = if name.family() == Family::ColumnAggregator {
                    Category::Column
                } else {
                    Category::Numeric
                };
                Ok(Expr {
                    kind: ExprKind::Function { name, params },
                    category,
                    expr_type: ExprType::Aggregate,
                })
            }
            Family::NumericTransformer if name == FunctionName::SubtractTimestamps => {
                let first = self.identifier_param()?;
                self.expect_symbol(Symbol::Comma)?;
                let second = self.identifier_param()?;
                self.expect_symbol(Symbol::RightParen)?;
                Ok(Expr {
                    kind: ExprKind::Function {
                        name,
                        params: vec![first, second],
                    },
                    category: Category::Numeric,
                    expr_type: ExprType::Column,
                })
            }
            Family::NumericTransformer => {
                let param = self.condition()?;
                match param.category {
                    Category::Temporal => {}
                    Category::Column if !param.is_compound_column() => {}
                    _ => return Err(syntax(format!("unexpected {}", param))),
                }
                self.expect_symbol(Symbol::RightParen)?;
                let expr_type = param.expr_type;
                Ok(Expr {
                    kind: ExprKind::Function {
                        name,
                        params: vec![param],
                    },
                    category: Category::Numeric,
                    expr_type,
                })
            }
            Family::TemporalTransformer => {
                if !self.at_symbol(Symbol::RightParen) {
                    return Err(syntax(format!(
                        "unexpected {}, expecting RIGHT_PARANTHESIS",
                        self.peek_name()
                    )));
                }
                self.pos += 1;
                Ok(Expr {
                    kind: ExprKind::Function {
                        name,
                        params: Vec::new(),
                    },
                    category: Category::Temporal,
                    expr_type: ExprType::Literal,
                })
            }
            Family::StringTransformer => {
                let mut params = vec![self.identifier_param()?];
                let fields = if name == FunctionName::MapBlobJsonFetch { 2 } else { 1 };
                for _ in 0..fields {
                    self.expect_symbol(Symbol::Comma)?;
                    params.push(self.string_param()?);
                }
                self.expect_symbol(Symbol::RightParen)?;
                Ok(Expr {
                    kind: ExprKind::Function { name, params },
                    category: Category::String,
                    expr_type: ExprType::Column,
                })
            }
            Family::TableAggregator => Err(syntax(format!("unexpected {}", name.name()))),
        }
    }

    fn generic_params(&mut self, name: FunctionName) -> PResult<Vec<Expr>> {
        let arity = if name == FunctionName::Corr { 2 } else { 1 };
        let mut params = Vec::with_capacity(arity);
        for i in 0..arity {
            if i > 0 {
                self.expect_symbol(Symbol::Comma)?;
            }
            let param = self.condition()?;
            if param.has_subquery() {
                return Err(syntax("unexpected subquery"));
            }
            params.push(param);
        }
        self.expect_symbol(Symbol::RightParen)?;
        Ok(params)
    }

    fn identifier_param(&mut self) -> PResult<Expr> {
        match self.peek() {
            Some(Token::Identifier(_)) => Ok(Expr::identifier(self.qualified_name()?)),
            _ => Err(syntax("IDENTIFIER expected")),
        }
    }

    fn string_param(&mut self) -> PResult<Expr> {
        match self.peek() {
            Some(Token::String(s)) => {
                let s = s.clone();
                self.pos += 1;
                Ok(Expr::literal(Literal::String(s)))
            }
            _ => Err(syntax("STRING expected")),
        }
    }
}

fn function_name(kw: Keyword) -> Option<FunctionName> {
    let name = match kw {
        Keyword::TCount => FunctionName::TCount,
        Keyword::TCorr => FunctionName::TCorr,
        Keyword::TCov => FunctionName::TCov,
        Keyword::Min => FunctionName::Min,
        Keyword::Max => FunctionName::Max,
        Keyword::First => FunctionName::First,
        Keyword::Last => FunctionName::Last,
        Keyword::Count => FunctionName::Count,
        Keyword::Sum => FunctionName::Sum,
        Keyword::Mean => FunctionName::Mean,
        Keyword::Variance => FunctionName::Variance,
        Keyword::Stdev => FunctionName::Stdev,
        Keyword::Corr => FunctionName::Corr,
        Keyword::Year => FunctionName::Year,
        Keyword::Month => FunctionName::Month,
        Keyword::Day => FunctionName::Day,
        Keyword::Hour => FunctionName::Hour,
        Keyword::Minute => FunctionName::Minute,
        Keyword::Second => FunctionName::Second,
        Keyword::SubtractTimestamps => FunctionName::SubtractTimestamps,
        Keyword::Now => FunctionName::Now,
        Keyword::JsonFetch => FunctionName::JsonFetch,
        Keyword::MapBlobJsonFetch => FunctionName::MapBlobJsonFetch,
        _ => return None,
    };
    Some(name)
}

fn flip_sign(number: &str) -> String {
    match number.strip_prefix('-') {
        Some(positive) => positive.to_string(),
        None => format!("-{}", number),
    }
}

/// Literals adopt the other side's type; column and aggregate never mix
fn infer_type(left: &Expr, right: &Expr) -> PResult<ExprType> {
    match (left.expr_type, right.expr_type) {
        (ExprType::Literal, t) | (t, ExprType::Literal) => Ok(t),
        (a, b) if a == b => Ok(a),
        _ => Err(syntax("unexpected aggregation function")),
    }
}

fn fail_on_compound(expr: &Expr) -> PResult<()> {
    if expr.is_compound_column() {
        return Err(syntax(format!("unexpected {}", expr)));
    }
    Ok(())
}

fn require_name(expr: &Expr) -> PResult<()> {
    if expr.as_identifier().is_none() {
        return Err(syntax("IDENTIFIER expected"));
    }
    Ok(())
}

fn arithmetic(
    op: BinaryOp,
    op_name: &str,
    right_start: &str,
    left: Expr,
    right: Expr,
) -> PResult<Expr> {
    use Category::*;
    let additive = matches!(op, BinaryOp::Add | BinaryOp::Sub);

    let category = match (left.category, right.category) {
        (Temporal, _) => {
            if !additive {
                return Err(syntax(format!("unexpected {}", op_name)));
            }
            if right.category != Interval {
                return Err(syntax(format!(
                    "unexpected {}, expecting TIME_INTERVAL or PLUS_SIGN or MINUS_SIGN or LEFT_PARANTHESIS",
                    right_start
                )));
            }
            Temporal
        }
        (Interval, Temporal) if op == BinaryOp::Add => Temporal,
        (Interval, Column) if op == BinaryOp::Add => {
            fail_on_compound(&right)?;
            Temporal
        }
        (Column, Interval) if additive => {
            fail_on_compound(&left)?;
            Temporal
        }
        (Column, Column) => Column,
        (Numeric, Numeric) | (Numeric, Column) | (Column, Numeric) => Numeric,
        _ => return Err(syntax(format!("unexpected {}", op_name))),
    };

    let expr_type = infer_type(&left, &right)?;
    Ok(Expr {
        kind: ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        category,
        expr_type,
    })
}

fn compare(op: BinaryOp, op_name: &str, left: Expr, right: Expr) -> PResult<Expr> {
    use Category::*;
    let equality = matches!(op, BinaryOp::Eq | BinaryOp::Ne);
    let stringish = |c: Category| matches!(c, String | Binary);

    match (left.category, right.category) {
        (Temporal, Temporal) => {}
        (Temporal, Column) => fail_on_compound(&right)?,
        (Numeric, Numeric) | (Numeric, Column) => {}
        (Column, Temporal) => fail_on_compound(&left)?,
        (Column, Numeric) | (Column, Column) => {}
        (Column, r) if stringish(r) => require_name(&left)?,
        (l, Column) if stringish(l) => require_name(&right)?,
        (Column, Boolean) | (Column, Uuid) => {
            require_name(&left)?;
            if !equality {
                return Err(syntax(format!("unexpected {}", op_name)));
            }
        }
        (Boolean, Column) | (Uuid, Column) => {
            require_name(&right)?;
            if !equality {
                return Err(syntax(format!("unexpected {}", op_name)));
            }
        }
        (String, String)
            if left.as_literal().is_none() || right.as_literal().is_none() => {}
        _ => return Err(syntax(format!("unexpected {}", op_name))),
    }

    let expr_type = infer_type(&left, &right)?;
    Ok(Expr {
        kind: ExprKind::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        category: Category::Condition,
        expr_type,
    })
}

/// Push a `not` down to the comparisons
fn negate(expr: Expr) -> PResult<Expr> {
    if expr.category != Category::Condition {
        return Err(syntax("unexpected NOT"));
    }
    let Expr {
        kind,
        category,
        expr_type,
    } = expr;
    let kind = match kind {
        ExprKind::Binary { op, left, right } if op.is_logical() => ExprKind::Binary {
            op: op.negated(),
            left: Box::new(negate(*left)?),
            right: Box::new(negate(*right)?),
        },
        ExprKind::Binary { op, left, right } => ExprKind::Binary {
            op: op.negated(),
            left,
            right,
        },
        ExprKind::IsNull { negated, expr } => ExprKind::IsNull {
            negated: !negated,
            expr,
        },
        ExprKind::In {
            negated,
            expr,
            query,
        } => ExprKind::In {
            negated: !negated,
            expr,
            query,
        },
        _ => return Err(syntax("unexpected NOT")),
    };
    Ok(Expr {
        kind,
        category,
        expr_type,
    })
}

/// Projection rules that depend on the whole select
fn check_select(select: &Select) -> PResult<()> {
    match &select.group_by {
        Some(group) => {
            let mut references: Vec<String> = Vec::new();
            for item in &group.items {
                let reference = item.reference();
                if references.contains(&reference) {
                    return Err(syntax("duplicate reference"));
                }
                references.push(reference);
            }

            for item in &select.items {
                let expr = match item {
                    SelectItem::Wildcard => return Err(syntax("unexpected ASTERISK")),
                    SelectItem::Expr { expr, .. } => expr,
                };
                if expr.expr_type != ExprType::Aggregate {
                    return Err(syntax("aggregate function or expression expected"));
                }
                if item.alias().is_none() {
                    return Err(syntax("AS expected"));
                }
                let reference = item.reference();
                if references.contains(&reference) {
                    return Err(syntax("duplicate reference"));
                }
                references.push(reference);
            }

            if let Some(having) = &group.having {
                for column in having.columns() {
                    if column.owner.is_some() {
                        return Err(syntax("unexpected PERIOD"));
                    }
                    if !references.contains(&column.name) {
                        return Err(syntax("unknown column name"));
                    }
                }
            }

            for order in &select.order_by {
                for column in order.expr.columns() {
                    let full = column.full_name();
                    if !references.contains(&full) {
                        return Err(syntax("unknown column name"));
                    }
                }
            }
        }
        None => {
            let mut aggregate = false;
            let mut plain = false;
            for item in &select.items {
                match item {
                    SelectItem::Wildcard => plain = true,
                    SelectItem::Expr { expr, .. } => match expr.expr_type {
                        ExprType::Aggregate => aggregate = true,
                        ExprType::Column => plain = true,
                        ExprType::Literal => {}
                    },
                }
            }
            if aggregate && plain {
                return Err(syntax("unexpected aggregation expression"));
            }
        }
    }
    Ok(())
}
