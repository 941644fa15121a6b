//! Rollback command generation
//!
//! Maps a forward DDL statement to the statement that undoes it. Only
//! creation-style statements have an inverse; drops, cluster deletion and
//! any DML are irreversible and yield `None`.

use crate::sql::{quote_identifier, unquote_identifier};
use regex::Regex;
use std::sync::OnceLock;

const NAME: &str = r"((?:`[^`]+`|[A-Za-z0-9_]+)(?:\.(?:`[^`]+`|[A-Za-z0-9_]+))?)";

struct Patterns {
    create_table: Regex,
    create_cluster: Regex,
    alter_cluster: Regex,
    join_cluster: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let build = |pattern: String| Regex::new(&pattern).expect("rollback pattern is valid");
        Patterns {
            create_table: build(format!(
                r"(?i)^\s*CREATE\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?{NAME}"
            )),
            create_cluster: build(format!(r"(?i)^\s*CREATE\s+CLUSTER\s+{NAME}")),
            alter_cluster: build(format!(
                r"(?i)^\s*ALTER\s+CLUSTER\s+{NAME}\s+(ADD|DROP)\s+{NAME}\s*;?\s*$"
            )),
            join_cluster: build(format!(r"(?i)^\s*JOIN\s+CLUSTER\s+{NAME}")),
        }
    })
}

fn requote(name: &str) -> String {
    quote_identifier(&unquote_identifier(name))
}

/// Generates inverse statements for queued commands
pub struct RollbackCommandGenerator;

impl RollbackCommandGenerator {
    /// Return the statement undoing `query`, or `None` when it cannot be undone
    pub fn generate(query: &str) -> Option<String> {
        let patterns = patterns();

        if let Some(caps) = patterns.alter_cluster.captures(query) {
            let cluster = requote(&caps[1]);
            let table = requote(&caps[3]);
            let inverse = if caps[2].eq_ignore_ascii_case("ADD") {
                "DROP"
            } else {
                "ADD"
            };
            return Some(format!("ALTER CLUSTER {} {} {}", cluster, inverse, table));
        }

        if let Some(caps) = patterns.create_table.captures(query) {
            return Some(format!("DROP TABLE IF EXISTS {}", requote(&caps[1])));
        }

        if let Some(caps) = patterns.create_cluster.captures(query) {
            return Some(format!("DELETE CLUSTER {}", requote(&caps[1])));
        }

        if let Some(caps) = patterns.join_cluster.captures(query) {
            return Some(format!("DELETE CLUSTER {}", requote(&caps[1])));
        }

        None
    }

    /// Rollback text as stored in the queue: empty when irreversible
    pub fn generate_or_empty(query: &str) -> String {
        Self::generate(query).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table() {
        assert_eq!(
            RollbackCommandGenerator::generate("CREATE TABLE IF NOT EXISTS t (id bigint)"),
            Some("DROP TABLE IF EXISTS t".to_string())
        );
        assert_eq!(
            RollbackCommandGenerator::generate("create table system.products_s3 (title text)"),
            Some("DROP TABLE IF EXISTS system.products_s3".to_string())
        );
    }

    #[test]
    fn test_distributed_table() {
        let query =
            "CREATE TABLE products type='distributed' local='system.products_s0' agent='10.0.0.2:9308:system.products_s1'";
        assert_eq!(
            RollbackCommandGenerator::generate(query),
            Some("DROP TABLE IF EXISTS products".to_string())
        );
    }

    #[test]
    fn test_irreversible() {
        assert_eq!(RollbackCommandGenerator::generate("DROP TABLE t"), None);
        assert_eq!(RollbackCommandGenerator::generate("DELETE CLUSTER c1"), None);
        assert_eq!(
            RollbackCommandGenerator::generate("INSERT INTO t (id) VALUES (1)"),
            None
        );
        assert_eq!(
            RollbackCommandGenerator::generate("UPDATE t SET a = 1 WHERE id = 1"),
            None
        );
        assert_eq!(RollbackCommandGenerator::generate_or_empty("DROP TABLE t"), "");
    }

    #[test]
    fn test_cluster_statements() {
        assert_eq!(
            RollbackCommandGenerator::generate("CREATE CLUSTER c_ab 'c_ab' as path"),
            Some("DELETE CLUSTER c_ab".to_string())
        );
        assert_eq!(
            RollbackCommandGenerator::generate("JOIN CLUSTER c_ab AT '10.0.0.1:9312' 'c_ab' as path"),
            Some("DELETE CLUSTER c_ab".to_string())
        );
    }

    #[test]
    fn test_alter_cluster_is_involution() {
        let forward = "ALTER CLUSTER c_ab ADD system.t_s0";
        let inverse = RollbackCommandGenerator::generate(forward).unwrap();
        assert_eq!(inverse, "ALTER CLUSTER c_ab DROP system.t_s0");
        assert_eq!(
            RollbackCommandGenerator::generate(&inverse),
            Some(forward.to_string())
        );
    }

    #[test]
    fn test_requotes_identifiers() {
        assert_eq!(
            RollbackCommandGenerator::generate("CREATE TABLE `my-table` (id bigint)"),
            Some("DROP TABLE IF EXISTS `my-table`".to_string())
        );
        assert_eq!(
            RollbackCommandGenerator::generate("CREATE TABLE `select` (id bigint)"),
            Some("DROP TABLE IF EXISTS `select`".to_string())
        );
    }
}
