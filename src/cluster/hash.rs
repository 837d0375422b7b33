//! Canonical, order-independent fingerprint of a configuration tree.
//!
//! The digest identifies *which* configuration a data plane has applied; it
//! is an equality token, not an authenticity check. Canonical form tags each
//! scalar kind distinctively so `null`, `"null"` and absence all hash apart.

use crate::types::ConfigTable;
use md5::{Digest, Md5};
use serde_json::Value;

/// Canonical text form of a tree.
///
/// - `null` → `/null/`
/// - string `s` → `$s$`
/// - number `n` → `#n#`
/// - boolean `b` → `?b?`
/// - object → entries sorted by key, `{k1:v1;k2:v2}` (empty: `{}`)
/// - array → entries in order, keyed by 1-based index in number form
///
/// Arrays keep their order: element position is semantic, only object-key
/// permutation must not affect the digest.
pub fn canonical(tree: &ConfigTable) -> String {
    let mut out = String::new();
    encode_into(tree, &mut out);
    out
}

/// 32-hex fingerprint of a tree: MD5 over the canonical form.
pub fn config_hash(tree: &ConfigTable) -> String {
    let mut hasher = Md5::new();
    hasher.update(canonical(tree).as_bytes());
    hex::encode(hasher.finalize())
}

fn encode_into(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("/null/"),
        Value::Bool(b) => {
            out.push('?');
            out.push_str(if *b { "true" } else { "false" });
            out.push('?');
        }
        Value::Number(n) => {
            out.push('#');
            out.push_str(&n.to_string());
            out.push('#');
        }
        Value::String(s) => {
            out.push('$');
            out.push_str(s);
            out.push('$');
        }
        Value::Array(items) => {
            out.push('{');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(';');
                }
                out.push('#');
                out.push_str(&(i + 1).to_string());
                out.push('#');
                out.push(':');
                encode_into(item, out);
            }
            out.push('}');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(';');
                }
                out.push('$');
                out.push_str(key);
                out.push('$');
                out.push(':');
                encode_into(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::{HASH_LEN, ZERO_HASH};
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn scalar_forms() {
        assert_eq!(canonical(&json!(null)), "/null/");
        assert_eq!(canonical(&json!("a")), "$a$");
        assert_eq!(canonical(&json!(3)), "#3#");
        assert_eq!(canonical(&json!(3.5)), "#3.5#");
        assert_eq!(canonical(&json!(true)), "?true?");
        assert_eq!(canonical(&json!({})), "{}");
    }

    #[test]
    fn object_entries_sorted() {
        assert_eq!(
            canonical(&json!({"b": 1, "a": {"z": null}})),
            "{$a$:{$z$:/null/};$b$:#1#}"
        );
    }

    #[test]
    fn array_order_is_semantic() {
        assert_eq!(canonical(&json!([1, 2])), "{#1#:#1#;#2#:#2#}");
        assert_ne!(config_hash(&json!([1, 2])), config_hash(&json!([2, 1])));
    }

    #[test]
    fn key_permutation_invariance() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"x":1,"y":{"p":true,"q":"s"},"z":[1,2]}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"z":[1,2],"y":{"q":"s","p":true},"x":1}"#).unwrap();
        assert_eq!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn null_distinguished_from_absent() {
        assert_ne!(config_hash(&json!({"a": null})), config_hash(&json!({})));
        assert_ne!(config_hash(&json!({"a": null})), config_hash(&json!({"a": "null"})));
    }

    #[test]
    fn digest_shape() {
        let h = config_hash(&json!({"plugins": ["key-auth"]}));
        assert_eq!(h.len(), HASH_LEN);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(h, ZERO_HASH);
    }

    fn arb_tree() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(json!(null)),
            any::<bool>().prop_map(|b| json!(b)),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z]{0,8}".prop_map(|s| json!(s)),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| serde_json::Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn reserialized_trees_hash_equal(tree in arb_tree()) {
            let text = serde_json::to_string(&tree).unwrap();
            let reparsed: serde_json::Value = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(config_hash(&tree), config_hash(&reparsed));
        }

        #[test]
        fn added_key_changes_hash(tree in arb_tree(), n in any::<i64>()) {
            let mut wrapped = serde_json::Map::new();
            wrapped.insert("body".to_string(), tree.clone());
            let before = config_hash(&serde_json::Value::Object(wrapped.clone()));
            wrapped.insert("extra".to_string(), json!(n));
            let after = config_hash(&serde_json::Value::Object(wrapped));
            prop_assert_ne!(before, after);
        }
    }
}
