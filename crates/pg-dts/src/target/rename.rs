//! Suffix rewriting of object names in schema statements.
//!
//! The rewrite is textual and positional, not a SQL parser: an identifier is
//! renamed only when it sits in a position known to hold a table, index or
//! constraint name (after `TABLE`, `INDEX`, `CONSTRAINT`, `REFERENCES`, or
//! after `ON` inside an index definition). Anything the heuristic does not
//! recognize passes through unchanged rather than risking malformed SQL.

/// Append `suffix` to the object names of one schema statement.
pub fn rewrite_statement(sql: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return sql.to_string();
    }

    let tokens: Vec<&str> = sql.split_whitespace().collect();
    let upper: Vec<String> = tokens.iter().map(|t| t.to_uppercase()).collect();
    let is_index_stmt = upper.iter().any(|t| t == "INDEX");

    let mut out: Vec<String> = Vec::with_capacity(tokens.len());
    for (i, token) in tokens.iter().enumerate() {
        let prev = i.checked_sub(1).map(|j| upper[j].as_str()).unwrap_or("");
        let prev2 = i.checked_sub(2).map(|j| upper[j].as_str()).unwrap_or("");

        let rename = match prev {
            // CREATE TABLE x, ALTER TABLE x, TRUNCATE TABLE x
            "TABLE" => upper[i] != "IF",
            // CREATE [UNIQUE] INDEX i
            "INDEX" => upper[i] != "IF",
            // ... IF [NOT] EXISTS x
            "EXISTS" => prev2 == "NOT" || prev2 == "IF",
            // ADD CONSTRAINT c
            "CONSTRAINT" => true,
            // index target table: CREATE INDEX i ON t
            "ON" => is_index_stmt,
            // FOREIGN KEY (...) REFERENCES t(...)
            "REFERENCES" => true,
            _ => false,
        };

        if rename {
            out.push(suffix_identifier(token, suffix));
        } else {
            out.push((*token).to_string());
        }
    }

    // split_whitespace collapses runs of whitespace; schema statements do not
    // depend on exact spacing.
    out.join(" ")
}

/// Append the suffix to the identifier inside a token, preserving schema
/// qualification, quoting, and trailing punctuation such as `(`, `,`, `;`.
fn suffix_identifier(token: &str, suffix: &str) -> String {
    // Separate the identifier from anything following it.
    let cut = token
        .find(|c| matches!(c, '(' | ',' | ';'))
        .unwrap_or(token.len());
    let (ident, rest) = token.split_at(cut);
    if ident.is_empty() {
        return token.to_string();
    }

    // Keep schema qualification intact.
    let (prefix, name) = match ident.rfind('.') {
        Some(dot) => (&ident[..=dot], &ident[dot + 1..]),
        None => ("", ident),
    };
    if name.is_empty() {
        return token.to_string();
    }

    let renamed = if let Some(inner) = name.strip_suffix('"') {
        format!("{inner}{suffix}\"")
    } else {
        format!("{name}{suffix}")
    };

    format!("{prefix}{renamed}{rest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_suffix_is_identity() {
        let sql = "CREATE TABLE public.t (id integer)";
        assert_eq!(rewrite_statement(sql, ""), sql);
    }

    #[test]
    fn test_create_table() {
        assert_eq!(
            rewrite_statement("CREATE TABLE public.t ( id integer )", "_v2"),
            "CREATE TABLE public.t_v2 ( id integer )"
        );
        assert_eq!(
            rewrite_statement("CREATE TABLE t (id integer)", "_v2"),
            "CREATE TABLE t_v2 (id integer)"
        );
    }

    #[test]
    fn test_create_table_if_not_exists() {
        assert_eq!(
            rewrite_statement("CREATE TABLE IF NOT EXISTS public.t (id integer)", "_x"),
            "CREATE TABLE IF NOT EXISTS public.t_x (id integer)"
        );
    }

    #[test]
    fn test_alter_table_add_constraint() {
        assert_eq!(
            rewrite_statement(
                "ALTER TABLE public.t ADD CONSTRAINT t_u_key UNIQUE (u)",
                "_v2"
            ),
            "ALTER TABLE public.t_v2 ADD CONSTRAINT t_u_key_v2 UNIQUE (u)"
        );
    }

    #[test]
    fn test_foreign_key_references() {
        assert_eq!(
            rewrite_statement(
                "ALTER TABLE public.orders ADD CONSTRAINT orders_fk FOREIGN KEY (uid) REFERENCES public.users(id)",
                "_m"
            ),
            "ALTER TABLE public.orders_m ADD CONSTRAINT orders_fk_m FOREIGN KEY (uid) REFERENCES public.users_m(id)"
        );
    }

    #[test]
    fn test_create_index() {
        assert_eq!(
            rewrite_statement(
                "CREATE INDEX idx_t_v ON public.t USING btree (v)",
                "_v2"
            ),
            "CREATE INDEX idx_t_v_v2 ON public.t_v2 USING btree (v)"
        );
        assert_eq!(
            rewrite_statement("CREATE UNIQUE INDEX u_idx ON t (a, b)", "_v2"),
            "CREATE UNIQUE INDEX u_idx_v2 ON t_v2 (a, b)"
        );
    }

    #[test]
    fn test_quoted_identifier() {
        assert_eq!(
            rewrite_statement("CREATE TABLE public.\"Order\" (id integer)", "_v2"),
            "CREATE TABLE public.\"Order_v2\" (id integer)"
        );
    }

    #[test]
    fn test_on_outside_index_statement_untouched() {
        // `ON` in a GRANT is not an index target position.
        let sql = "GRANT SELECT ON public.t TO app";
        assert_eq!(rewrite_statement(sql, "_v2"), sql);
    }

    #[test]
    fn test_unrecognized_statement_falls_through() {
        let sql = "COMMENT ON COLUMN public.t.v IS 'text'";
        // no INDEX in statement, so the ON position is left alone
        assert_eq!(rewrite_statement(sql, "_v2"), sql);
    }

    #[test]
    fn test_token_with_trailing_paren() {
        assert_eq!(
            rewrite_statement("CREATE TABLE t( id integer )", "_s"),
            "CREATE TABLE t_s( id integer )"
        );
    }
}
