use sha2::{Digest, Sha256};

/// The kernel rejects chain names longer than this, callers must stay under
/// it when generating their own names.
pub const MAX_CHAIN_NAME_LENGTH: usize = 28;

// Truncated length of a rule identifier.  16 base64 characters of a sha256
// digest is plenty to keep collisions out of a single chain.
const HASH_LENGTH: usize = 16;

// Dummy comment fragment hashed in place of the real one; the real fragment
// embeds the identifier itself so it cannot take part in the digest.
const HASH_PLACEHOLDER: &str = "HASH";

/// Chains created by the kernel itself for each table.  Everything else in a
/// table was created by some userspace program.
pub fn kernel_chains(table: &str) -> &'static [&'static str] {
    match table {
        "filter" => &["INPUT", "FORWARD", "OUTPUT"],
        "nat" => &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"],
        "mangle" => &["PREROUTING", "INPUT", "FORWARD", "OUTPUT", "POSTROUTING"],
        "raw" => &["PREROUTING", "OUTPUT"],
        _ => &[],
    }
}

/// A single iptables rule, carried as its already formatted match/target
/// fragment, e.g. `-m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT`.
/// The action (`-A`/`-I`/`-R`), chain name and identifier comment are
/// rendered on demand so the same rule can be appended, inserted or used as
/// an in-place replacement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub spec: String,
}

impl Rule {
    pub fn new<S: Into<String>>(spec: S) -> Rule {
        Rule { spec: spec.into() }
    }

    /// Render as an append to the end of the chain.
    pub fn render_append(&self, chain_name: &str, prefix_frag: &str) -> String {
        format!("-A {} {} {}", chain_name, prefix_frag, self.spec)
    }

    /// Render as an insert at the top of the chain.
    pub fn render_insert(&self, chain_name: &str, prefix_frag: &str) -> String {
        format!("-I {} 1 {} {}", chain_name, prefix_frag, self.spec)
    }

    /// Render as a replacement of the rule at 1-indexed position `rule_num`.
    pub fn render_replace(&self, chain_name: &str, rule_num: usize, prefix_frag: &str) -> String {
        format!("-R {} {} {} {}", chain_name, rule_num, prefix_frag, self.spec)
    }
}

/// A named, ordered set of rules making up one chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chain {
    pub name: String,
    pub rules: Vec<Rule>,
}

impl Chain {
    pub fn new<S: Into<String>>(name: S, rules: Vec<Rule>) -> Chain {
        Chain {
            name: name.into(),
            rules,
        }
    }

    /// Identifiers for this chain's rules, one per slot.
    pub fn rule_hashes(&self) -> Vec<String> {
        rule_hashes(&self.name, &self.rules)
    }
}

/// Calculate the identifier for each rule slot.  Each digest covers the
/// chain name, the slot index and the rule rendered in append form: editing
/// a rule or moving it to another slot changes its identifier, while every
/// untouched slot keeps its identifier so the diff against the kernel stays
/// minimal.
pub fn rule_hashes(chain_name: &str, rules: &[Rule]) -> Vec<String> {
    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            let mut hasher = Sha256::new();
            hasher.update(chain_name.as_bytes());
            hasher.update((i as u64).to_be_bytes());
            hasher.update(rule.render_append(chain_name, HASH_PLACEHOLDER).as_bytes());
            // The URL-safe alphabet keeps identifiers inside [a-zA-Z0-9_-],
            // which both the comment scanner and the shell are happy with.
            let mut hash = base64::encode_config(hasher.finalize(), base64::URL_SAFE_NO_PAD);
            hash.truncate(HASH_LENGTH);
            hash
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chain() -> Chain {
        Chain::new(
            "test-chain",
            vec![
                Rule::new("-m conntrack --ctstate RELATED,ESTABLISHED -j ACCEPT"),
                Rule::new("-j DROP"),
            ],
        )
    }

    #[test]
    fn test_render_forms() {
        let rule = Rule::new("-j DROP");
        let frag = "-m comment --comment \"pfx:abc\"";
        assert_eq!(
            rule.render_append("c", frag),
            "-A c -m comment --comment \"pfx:abc\" -j DROP"
        );
        assert_eq!(
            rule.render_insert("c", frag),
            "-I c 1 -m comment --comment \"pfx:abc\" -j DROP"
        );
        assert_eq!(
            rule.render_replace("c", 4, frag),
            "-R c 4 -m comment --comment \"pfx:abc\" -j DROP"
        );
    }

    #[test]
    fn test_hashes_are_stable_and_well_formed() {
        let chain = sample_chain();
        let hashes = chain.rule_hashes();
        assert_eq!(hashes, chain.rule_hashes());
        assert_eq!(hashes.len(), 2);
        for hash in &hashes {
            assert_eq!(hash.len(), HASH_LENGTH);
            assert!(hash
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
        }
    }

    #[test]
    fn test_hash_depends_on_chain_name() {
        let chain = sample_chain();
        let renamed = Chain::new("other-chain", chain.rules.clone());
        assert_ne!(chain.rule_hashes()[0], renamed.rule_hashes()[0]);
    }

    #[test]
    fn test_hash_depends_on_content() {
        let chain = sample_chain();
        let mut edited = chain.clone();
        edited.rules[0] = Rule::new("-j RETURN");
        assert_ne!(chain.rule_hashes()[0], edited.rule_hashes()[0]);
    }

    #[test]
    fn test_hash_depends_on_position() {
        // The same rule content in different slots must get different
        // identifiers, otherwise a moved rule would go undetected.
        let rules = vec![Rule::new("-j DROP"), Rule::new("-j DROP")];
        let hashes = rule_hashes("test-chain", &rules);
        assert_ne!(hashes[0], hashes[1]);
    }

    #[test]
    fn test_moving_a_rule_changes_its_hash() {
        let chain = sample_chain();
        let hashes = chain.rule_hashes();

        let mut shifted_rules = vec![Rule::new("-j LOG")];
        shifted_rules.extend(chain.rules.clone());
        let shifted = rule_hashes(&chain.name, &shifted_rules);

        // Both original rules moved down one slot, their identifiers change.
        assert_ne!(shifted[1], hashes[0]);
        assert_ne!(shifted[2], hashes[1]);
    }

    #[test]
    fn test_editing_one_rule_leaves_other_hashes_alone() {
        let rules = vec![
            Rule::new("-p tcp --dport 22 -j ACCEPT"),
            Rule::new("-p tcp --dport 80 -j ACCEPT"),
            Rule::new("-j DROP"),
        ];
        let before = rule_hashes("test-chain", &rules);

        let mut edited = rules;
        edited[1] = Rule::new("-p tcp --dport 8080 -j ACCEPT");
        let after = rule_hashes("test-chain", &edited);

        assert_eq!(after[0], before[0]);
        assert_ne!(after[1], before[1]);
        assert_eq!(after[2], before[2]);
    }

    #[test]
    fn test_kernel_chains_per_table() {
        assert_eq!(kernel_chains("filter"), &["INPUT", "FORWARD", "OUTPUT"]);
        assert_eq!(
            kernel_chains("nat"),
            &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"]
        );
        assert_eq!(kernel_chains("raw"), &["PREROUTING", "OUTPUT"]);
        assert!(kernel_chains("unknown").is_empty());
    }
}
