//! nsQL scanner
//!
//! Turns query text into a flat token list. The scanner never fails: input it
//! cannot make sense of becomes `Token::Unknown`, which the parser reports as
//! an unexpected token.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref INTEGER_RE: Regex = Regex::new(r"^-?[0-9]+$").unwrap();
    static ref FLOAT_RE: Regex = Regex::new(r"^-?[0-9]+[.][0-9]+$").unwrap();
    static ref UUID_RE: Regex = Regex::new(
        r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$"
    )
    .unwrap();
    static ref TIMESTAMP_RE: Regex = Regex::new(
        r"^[0-9]{4}-(0[0-9]|1[0-2])-([0-2][0-9]|3[0-1])\s+([0-1][0-9]|2[0-3])(:[0-5][0-9]){2}$"
    )
    .unwrap();
    static ref DATE_RE: Regex =
        Regex::new(r"^[0-9]{4}-(0[0-9]|1[0-2])-([0-2][0-9]|3[0-1])$").unwrap();
    static ref TIME_RE: Regex = Regex::new(r"^([0-1][0-9]|2[0-3])(:[0-5][0-9]){2}$").unwrap();
    static ref INTERVAL_RE: Regex = Regex::new(
        r"^INTERVAL(\s[0-9]+\s(YEAR|MONTH|WEEK|DAY|HOUR|MINUTE|SECOND)S*)+$"
    )
    .unwrap();
    static ref BINARY_RE: Regex = Regex::new(r"^0[xX][0-9a-fA-F]+$").unwrap();
}

/// Reserved words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Select,
    Create,
    Drop,
    Delete,
    Insert,
    Update,
    From,
    Where,
    As,
    All,
    Distinct,
    Exists,
    With,
    Asc,
    Desc,
    Join,
    Inner,
    Outer,
    Full,
    Left,
    Right,
    Semi,
    On,
    Group,
    Having,
    If,
    Order,
    By,
    Limit,
    Into,
    Values,
    Set,
    Table,
    Primary,
    Key,
    Clustering,
    Compact,
    Storage,
    Is,
    In,
    And,
    Or,
    Not,
    Union,
    Intersect,
    Between,
    Count,
    Sum,
    Min,
    Max,
    First,
    Last,
    Mean,
    Variance,
    Stdev,
    Corr,
    Now,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    TCount,
    TCorr,
    TCov,
    Ascii,
    Bigint,
    BooleanType,
    Counter,
    Decimal,
    Double,
    FloatType,
    Inet,
    Int,
    Text,
    TimestampType,
    Timeuuid,
    UuidType,
    Varchar,
    Varint,
    List,
    Map,
    MapBlobJsonFetch,
    JsonFetch,
    SubtractTimestamps,
}

impl Keyword {
    pub fn lookup(word: &str) -> Option<Keyword> {
        use Keyword::*;
        let kw = match word.to_ascii_lowercase().as_str() {
            "select" => Select,
            "create" => Create,
            "drop" => Drop,
            "delete" => Delete,
            "insert" => Insert,
            "update" => Update,
            "from" => From,
            "where" => Where,
            "as" => As,
            "all" => All,
            "distinct" => Distinct,
            "exists" => Exists,
            "with" => With,
            "asc" => Asc,
            "desc" => Desc,
            "join" => Join,
            "inner" => Inner,
            "outer" => Outer,
            "full" => Full,
            "left" => Left,
            "right" => Right,
            "semi" => Semi,
            "on" => On,
            "group" => Group,
            "having" => Having,
            "if" => If,
            "order" => Order,
            "by" => By,
            "limit" => Limit,
            "into" => Into,
            "values" => Values,
            "set" => Set,
            "table" => Table,
            "primary" => Primary,
            "key" => Key,
            "clustering" => Clustering,
            "compact" => Compact,
            "storage" => Storage,
            "is" => Is,
            "in" => In,
            "and" => And,
            "or" => Or,
            "not" => Not,
            "union" => Union,
            "intersect" => Intersect,
            "between" => Between,
            "count" => Count,
            "sum" => Sum,
            "min" => Min,
            "max" => Max,
            "first" => First,
            "last" => Last,
            "mean" | "avg" => Mean,
            "variance" => Variance,
            "stdev" => Stdev,
            "corr" => Corr,
            "now" => Now,
            "year" => Year,
            "month" => Month,
            "day" => Day,
            "hour" => Hour,
            "minute" => Minute,
            "second" => Second,
            "tcount" => TCount,
            "tcorr" => TCorr,
            "tcov" => TCov,
            "ascii" => Ascii,
            "bigint" => Bigint,
            "boolean" => BooleanType,
            "counter" => Counter,
            "decimal" => Decimal,
            "double" => Double,
            "float" => FloatType,
            "inet" => Inet,
            "int" => Int,
            "text" => Text,
            "timestamp" => TimestampType,
            "timeuuid" => Timeuuid,
            "uuid" => UuidType,
            "varchar" => Varchar,
            "varint" => Varint,
            "list" => List,
            "map" => Map,
            "map_blob_json_fetch" => MapBlobJsonFetch,
            "json_fetch" => JsonFetch,
            "subtract_timestamps" => SubtractTimestamps,
            _ => return None,
        };
        Some(kw)
    }

    /// Grammar name used in error messages
    pub fn name(&self) -> &'static str {
        use Keyword::*;
        match self {
            Select => "SELECT",
            Create => "CREATE",
            Drop => "DROP",
            Delete => "DELETE",
            Insert => "INSERT",
            Update => "UPDATE",
            From => "FROM",
            Where => "WHERE",
            As => "AS",
            All => "ALL",
            Distinct => "DISTINCT",
            Exists => "EXISTS",
            With => "WITH",
            Asc => "ASC",
            Desc => "DESC",
            Join => "JOIN",
            Inner => "INNER",
            Outer => "OUTER",
            Full => "FULL",
            Left => "LEFT",
            Right => "RIGHT",
            Semi => "SEMI",
            On => "ON",
            Group => "GROUP",
            Having => "HAVING",
            If => "IF",
            Order => "ORDER",
            By => "BY",
            Limit => "LIMIT",
            Into => "INTO",
            Values => "VALUES",
            Set => "SET",
            Table => "TABLE",
            Primary => "PRIMARY",
            Key => "KEY",
            Clustering => "CLUSTERING",
            Compact => "COMPACT",
            Storage => "STORAGE",
            Is => "IS",
            In => "IN",
            And => "AND",
            Or => "OR",
            Not => "NOT",
            Union => "UNION",
            Intersect => "INTERSECT",
            Between => "BETWEEN",
            Count => "COUNT",
            Sum => "SUM",
            Min => "MIN",
            Max => "MAX",
            First => "FIRST",
            Last => "LAST",
            Mean => "MEAN",
            Variance => "VARIANCE",
            Stdev => "STDEV",
            Corr => "CORR",
            Now => "NOW",
            Year => "YEAR",
            Month => "MONTH",
            Day => "DAY",
            Hour => "HOUR",
            Minute => "MINUTE",
            Second => "SECOND",
            TCount => "TCOUNT",
            TCorr => "TCORR",
            TCov => "TCOV",
            Ascii => "ASCII",
            Bigint => "BIGINT",
            BooleanType => "BOOLEANTYPE",
            Counter => "COUNTER",
            Decimal => "DECIMAL",
            Double => "DOUBLE",
            FloatType => "FLOATTYPE",
            Inet => "INET",
            Int => "INT",
            Text => "TEXT",
            TimestampType => "TIMESTAMPTYPE",
            Timeuuid => "TIMEUUID",
            UuidType => "UUIDTYPE",
            Varchar => "VARCHAR",
            Varint => "VARINT",
            List => "LIST",
            Map => "MAP",
            MapBlobJsonFetch => "MAP_BLOB_JSON_FETCH",
            JsonFetch => "JSON_FETCH",
            SubtractTimestamps => "SUBTRACT_TIMESTAMPS",
        }
    }

    /// Storage type keywords usable in a field description
    pub fn type_name(&self) -> Option<&'static str> {
        use Keyword::*;
        let name = match self {
            Ascii => "ascii",
            Bigint => "bigint",
            BooleanType => "boolean",
            Counter => "counter",
            Decimal => "decimal",
            Double => "double",
            FloatType => "float",
            Inet => "inet",
            Int => "int",
            Text => "text",
            TimestampType => "timestamp",
            Timeuuid => "timeuuid",
            UuidType => "uuid",
            Varchar => "varchar",
            Varint => "varint",
            _ => return None,
        };
        Some(name)
    }
}

/// Punctuation and operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    LessThan,
    GreaterThan,
    LessEqual,
    GreaterEqual,
    NotEqual,
    Exclamation,
    Equal,
    Plus,
    Minus,
    Asterisk,
    Slash,
    Percent,
    Ampersand,
    VerticalBar,
    Comma,
    Period,
    LeftParen,
    RightParen,
    Semicolon,
}

impl Symbol {
    pub fn name(&self) -> &'static str {
        match self {
            Symbol::LessThan | Symbol::LessEqual => "LESS_THAN",
            Symbol::GreaterThan | Symbol::GreaterEqual => "GREATER_THAN",
            Symbol::NotEqual | Symbol::Exclamation => "EXCLAMATION_MARK",
            Symbol::Equal => "EQUAL_SIGN",
            Symbol::Plus => "PLUS_SIGN",
            Symbol::Minus => "MINUS_SIGN",
            Symbol::Asterisk => "ASTERISK",
            Symbol::Slash => "SLASH",
            Symbol::Percent => "PERCENT_SIGN",
            Symbol::Ampersand => "AMPERSAND",
            Symbol::VerticalBar => "VERTICAL_BAR",
            Symbol::Comma => "COMMA",
            Symbol::Period => "PERIOD",
            Symbol::LeftParen => "LEFT_PARANTHESIS",
            Symbol::RightParen => "RIGHT_PARANTHESIS",
            Symbol::Semicolon => "SEMICOLON",
        }
    }
}

/// Scalar element of a collection literal
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Number(String),
    Quoted(String),
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Element::Number(n) => write!(f, "{}", n),
            Element::Quoted(s) => write!(f, "{}", quote(s)),
        }
    }
}

/// `{a, b}` or `{k: v, ...}`
#[derive(Debug, Clone, PartialEq)]
pub enum Collection {
    Set(Vec<Element>),
    Map(Vec<(Element, Element)>),
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Collection::Set(items) => {
                let parts: Vec<String> = items.iter().map(|e| e.to_string()).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            Collection::Map(items) => {
                let parts: Vec<String> =
                    items.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Keyword(Keyword),
    Identifier(String),
    Integer(String),
    Float(String),
    String(String),
    Uuid(String),
    Timestamp(String),
    Date(String),
    Time(String),
    Interval(String),
    Binary(Vec<u8>),
    Boolean(bool),
    Null,
    Collection(Collection),
    Symbol(Symbol),
    Unknown,
}

impl Token {
    /// Grammar name used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            Token::Keyword(k) => k.name(),
            Token::Identifier(_) => "IDENTIFIER",
            Token::Integer(_) => "INTEGER",
            Token::Float(_) => "FLOAT",
            Token::String(_) => "STRING",
            Token::Uuid(_) => "UUID",
            Token::Timestamp(_) => "TIMESTAMP",
            Token::Date(_) => "DATE",
            Token::Time(_) => "TIME",
            Token::Interval(_) => "TIME_INTERVAL",
            Token::Binary(_) => "BINARY",
            Token::Boolean(_) => "BOOLEAN",
            Token::Null => "NULL",
            Token::Collection(_) => "COLLECTION",
            Token::Symbol(s) => s.name(),
            Token::Unknown => "UNKNOWN",
        }
    }

    pub fn is_keyword(&self, kw: Keyword) -> bool {
        matches!(self, Token::Keyword(k) if *k == kw)
    }

    pub fn is_symbol(&self, sym: Symbol) -> bool {
        matches!(self, Token::Symbol(s) if *s == sym)
    }
}

/// Quote a string literal so the scanner reads it back unchanged
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// Scan the whole input
pub fn tokenize(code: &str) -> Vec<Token> {
    let mut scanner = Scanner {
        chars: code.chars().collect(),
        pos: 0,
    };
    let mut tokens = Vec::new();
    while let Some(token) = scanner.next_token() {
        let stop = token == Token::Unknown;
        tokens.push(token);
        if stop {
            break;
        }
    }
    tokens
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
}

impl Scanner {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn next_token(&mut self) -> Option<Token> {
        self.skip_spaces();
        let c = self.peek()?;
        let token = if c.is_alphabetic() {
            self.textual()
        } else if c.is_ascii_digit() {
            self.numeric()
        } else if c == '\'' || c == '`' {
            self.literal()
        } else if c == '{' {
            self.collection()
        } else {
            self.symbolic()
        };
        Some(token)
    }

    fn textual(&mut self) -> Token {
        let start = self.pos;
        self.pos += 1;
        while matches!(self.peek(), Some(c) if c == '_' || c.is_alphanumeric()) {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match word.to_ascii_lowercase().as_str() {
            "null" => Token::Null,
            "true" => Token::Boolean(true),
            "false" => Token::Boolean(false),
            _ => match Keyword::lookup(&word) {
                Some(kw) => Token::Keyword(kw),
                None => Token::Identifier(word),
            },
        }
    }

    fn numeric(&mut self) -> Token {
        let start = self.pos;
        self.pos += 1;
        while matches!(self.peek(), Some(c) if c == '.' || c.is_ascii_digit()) {
            self.pos += 1;
        }
        let number: String = self.chars[start..self.pos].iter().collect();
        if INTEGER_RE.is_match(&number) {
            Token::Integer(number)
        } else if FLOAT_RE.is_match(&number) {
            Token::Float(number)
        } else {
            Token::Unknown
        }
    }

    /// Quoted literal; a backslash escapes the next character
    fn literal(&mut self) -> Token {
        let delimiter = self.chars[self.pos];
        self.pos += 1;
        let mut content = String::new();
        loop {
            match self.peek() {
                None => return Token::Unknown,
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some(c) => content.push(c),
                        None => return Token::Unknown,
                    }
                    self.pos += 1;
                }
                Some(c) if c == delimiter => {
                    self.pos += 1;
                    break;
                }
                Some(c) => {
                    content.push(c);
                    self.pos += 1;
                }
            }
        }

        if delimiter == '`' {
            if content.is_empty() || !content.chars().all(|c| c == '_' || c.is_alphanumeric()) {
                return Token::Unknown;
            }
            return Token::Identifier(content);
        }

        classify_quoted(content)
    }

    fn collection(&mut self) -> Token {
        self.pos += 1;
        let mut current: Option<Element> = None;
        let mut key: Option<Element> = None;
        // None until the first separator decides between set and map
        let mut is_set: Option<bool> = None;
        let mut set_items: Vec<Element> = Vec::new();
        let mut map_items: Vec<(Element, Element)> = Vec::new();

        loop {
            self.skip_spaces();
            let c = match self.peek() {
                Some(c) => c,
                None => return Token::Unknown,
            };

            if c.is_ascii_digit() {
                if current.is_some() {
                    return Token::Unknown;
                }
                match self.numeric() {
                    Token::Integer(n) | Token::Float(n) => current = Some(Element::Number(n)),
                    _ => return Token::Unknown,
                }
            } else if c == '\'' {
                if current.is_some() {
                    return Token::Unknown;
                }
                match self.literal() {
                    Token::Unknown | Token::Identifier(_) => return Token::Unknown,
                    token => current = Some(Element::Quoted(literal_text(&token))),
                }
            } else if c == ':' {
                let element = match current.take() {
                    Some(e) => e,
                    None => return Token::Unknown,
                };
                if is_set == Some(true) || key.is_some() {
                    return Token::Unknown;
                }
                is_set = Some(false);
                key = Some(element);
                self.pos += 1;
            } else if c == ',' || c == '}' {
                let element = match current.take() {
                    Some(e) => e,
                    None => return Token::Unknown,
                };
                match is_set {
                    None | Some(true) if key.is_none() => {
                        is_set = Some(true);
                        if !set_items.contains(&element) {
                            set_items.push(element);
                        }
                    }
                    Some(false) => match key.take() {
                        Some(k) => {
                            map_items.retain(|(existing, _)| *existing != k);
                            map_items.push((k, element));
                        }
                        None => return Token::Unknown,
                    },
                    _ => return Token::Unknown,
                }
                self.pos += 1;

                if c == '}' {
                    return if is_set == Some(false) {
                        Token::Collection(Collection::Map(map_items))
                    } else {
                        Token::Collection(Collection::Set(set_items))
                    };
                }
            } else {
                return Token::Unknown;
            }
        }
    }

    fn symbolic(&mut self) -> Token {
        let c = self.chars[self.pos];
        self.pos += 1;
        let next = self.peek();
        let symbol = match (c, next) {
            ('<', Some('=')) => {
                self.pos += 1;
                Symbol::LessEqual
            }
            ('<', Some('>')) => {
                self.pos += 1;
                Symbol::NotEqual
            }
            ('>', Some('=')) => {
                self.pos += 1;
                Symbol::GreaterEqual
            }
            ('!', Some('=')) => {
                self.pos += 1;
                Symbol::NotEqual
            }
            ('<', _) => Symbol::LessThan,
            ('>', _) => Symbol::GreaterThan,
            ('!', _) => Symbol::Exclamation,
            ('=', Some('=')) => {
                self.pos += 1;
                Symbol::Equal
            }
            ('=', _) => Symbol::Equal,
            ('+', _) => Symbol::Plus,
            ('-', _) => Symbol::Minus,
            ('*', _) => Symbol::Asterisk,
            ('/', _) => Symbol::Slash,
            ('%', _) => Symbol::Percent,
            ('&', _) => Symbol::Ampersand,
            ('|', _) => Symbol::VerticalBar,
            (',', _) => Symbol::Comma,
            ('.', _) => Symbol::Period,
            ('(', _) => Symbol::LeftParen,
            (')', _) => Symbol::RightParen,
            (';', _) => Symbol::Semicolon,
            _ => return Token::Unknown,
        };
        Token::Symbol(symbol)
    }
}

/// Decide what a single-quoted literal holds
fn classify_quoted(content: String) -> Token {
    if UUID_RE.is_match(&content) {
        return Token::Uuid(content);
    }
    if TIMESTAMP_RE.is_match(&content) {
        return Token::Timestamp(content);
    }
    if DATE_RE.is_match(&content) {
        return Token::Date(content);
    }
    if TIME_RE.is_match(&content) {
        return Token::Time(content);
    }
    if INTERVAL_RE.is_match(&content.to_ascii_uppercase()) {
        return Token::Interval(content.to_lowercase());
    }
    if BINARY_RE.is_match(&content) {
        return match hex::decode(&content[2..]) {
            Ok(bytes) => Token::Binary(bytes),
            Err(_) => Token::Unknown,
        };
    }
    Token::String(content)
}

fn literal_text(token: &Token) -> String {
    match token {
        Token::String(s)
        | Token::Uuid(s)
        | Token::Timestamp(s)
        | Token::Date(s)
        | Token::Time(s)
        | Token::Interval(s) => s.clone(),
        Token::Binary(b) => format!("0x{}", hex::encode(b)),
        _ => String::new(),
    }
}
