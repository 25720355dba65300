use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use regex::Regex;

use crate::error::{ErrorWrap, RulevarkError, RulevarkResult};
use crate::exec::{CommandFactory, ExecCommandFactory};
use crate::ruleset::{self, Chain, Rule};

// How many times apply() re-runs a failed attempt before giving up, and the
// initial sleep between attempts.  The sleep doubles on every failure;
// losing a race against another iptables writer is expected and the next
// attempt re-scans, so short waits are enough.
const MAX_APPLY_RETRIES: usize = 10;
const INITIAL_BACKOFF: Duration = Duration::from_millis(1);

// Stand-in identifier recorded for rules that pre-date identifier comments.
// Contains a space so it can never collide with a real identifier.
const OLD_INSERT_SENTINEL: &str = "OLD INSERT RULE";

/// Owns the desired state of one kernel iptables table ("filter", "nat",
/// "mangle" or "raw") for one IP version and, on `apply()`, drives the
/// kernel toward it through `iptables-save`/`iptables-restore`.
///
/// Two classes of mutation are supported.  Whole-chain updates replace the
/// full contents of a chain we own; insertions prepend a small number of
/// rules to a chain we do not own (normally a kernel chain such as FORWARD)
/// to divert traffic into our chains.  Mutations are batched in memory and
/// only hit the kernel on `apply()`, so callers can build a consistent
/// picture first and the first apply after a restart does one atomic write.
///
/// Rules written by this type carry a short identifier in their first
/// comment.  Reading those identifiers back from `iptables-save` output is
/// how drift is detected without parsing rule bodies, and the per-slot diff
/// they enable means untouched rules are never rewritten, which preserves
/// their packet counters.
pub struct Table {
    pub name: String,
    pub ip_version: u8,

    // Rules to be inserted at the top of chains we don't own, keyed by chain
    // name.  Pre-populated with an empty list for every kernel chain of this
    // table so that insertions from a previous run get cleaned up even if
    // the caller never touches that chain.
    chain_to_inserted_rules: HashMap<String, Vec<Rule>>,
    dirty_inserts: HashSet<String>,

    // Desired contents of the chains we own, keyed by chain name.  A chain
    // scheduled for deletion has no entry here but its name stays in
    // dirty_chains.
    chains: HashMap<String, Chain>,
    dirty_chains: HashSet<String>,

    in_sync_with_dataplane: bool,

    // The rule identifiers we believe each kernel chain currently holds.
    // Replaced wholesale by a scan and patched after each successful
    // restore.  An empty string in a slot is a rule we don't own.
    chain_to_dataplane_hashes: HashMap<String, Vec<String>>,

    // Prefix tagging our identifiers inside rule comments, e.g. "cali:".
    hash_comment_prefix: String,
    // Extracts an identifier from a saved rule line.
    hash_comment_re: Regex,
    // Matches the names of chains we own.
    our_chains_re: Regex,
    // Flags rules inserted by old versions that didn't write identifiers.
    old_insert_re: Regex,

    // Save-output line shapes: ":chain-name - [0:0]" forward references and
    // "-A chain-name ..." appends.
    chain_create_re: Regex,
    append_re: Regex,

    save_cmd: &'static str,
    restore_cmd: &'static str,

    // Factory for subprocess handles, shimmed out in tests.
    cmd_factory: Box<dyn CommandFactory>,
}

impl Table {
    /// Create a table driving the real `iptables-save`/`iptables-restore`
    /// (or the `ip6tables` pair when `ip_version` is 6).
    ///
    /// `historic_chain_prefixes` lists every chain-name prefix this or any
    /// previous version has used; chains matching one of them are treated as
    /// ours.  `extra_cleanup_regex` optionally extends the pattern used to
    /// recognise legacy insertions that carry no identifier comment.
    pub fn new(
        name: &str,
        ip_version: u8,
        historic_chain_prefixes: &[&str],
        hash_prefix: &str,
        extra_cleanup_regex: Option<&str>,
    ) -> RulevarkResult<Table> {
        Table::with_command_factory(
            name,
            ip_version,
            historic_chain_prefixes,
            hash_prefix,
            extra_cleanup_regex,
            Box::new(ExecCommandFactory),
        )
    }

    /// Constructor taking an explicit command factory so tests can shim out
    /// the subprocesses.
    pub fn with_command_factory(
        name: &str,
        ip_version: u8,
        historic_chain_prefixes: &[&str],
        hash_prefix: &str,
        extra_cleanup_regex: Option<&str>,
        cmd_factory: Box<dyn CommandFactory>,
    ) -> RulevarkResult<Table> {
        // The comment looks like: --comment "cali:abcd1234_-"; quoting varies
        // between iptables versions so the quotes are optional.
        let hash_comment_re = Regex::new(&format!(
            "--comment \"?{}([a-zA-Z0-9_-]+)\"?",
            hash_prefix
        ))?;
        let our_chains_re = Regex::new(&format!("^({})", historic_chain_prefixes.join("|")))?;

        let mut old_insert_parts: Vec<String> = historic_chain_prefixes
            .iter()
            .map(|prefix| format!("(?:-j|--jump) {}", prefix))
            .collect();
        if let Some(extra) = extra_cleanup_regex {
            old_insert_parts.push(extra.to_string());
        }
        let old_insert_re = Regex::new(&old_insert_parts.join("|"))?;

        // Pre-populate the insertion map for the kernel chains of this table
        // and mark them dirty: the first apply then scrubs any insertions
        // left over from a previous run.
        let mut chain_to_inserted_rules = HashMap::new();
        let mut dirty_inserts = HashSet::new();
        for kernel_chain in ruleset::kernel_chains(name) {
            chain_to_inserted_rules.insert(kernel_chain.to_string(), Vec::new());
            dirty_inserts.insert(kernel_chain.to_string());
        }

        let (save_cmd, restore_cmd) = if ip_version == 4 {
            ("iptables-save", "iptables-restore")
        } else {
            ("ip6tables-save", "ip6tables-restore")
        };

        Ok(Table {
            name: name.to_string(),
            ip_version,
            chain_to_inserted_rules,
            dirty_inserts,
            chains: HashMap::new(),
            dirty_chains: HashSet::new(),
            in_sync_with_dataplane: false,
            chain_to_dataplane_hashes: HashMap::new(),
            hash_comment_prefix: hash_prefix.to_string(),
            hash_comment_re,
            our_chains_re,
            old_insert_re,
            chain_create_re: Regex::new(r"^:(\S+)")?,
            append_re: Regex::new(r"^-A (\S+)")?,
            save_cmd,
            restore_cmd,
            cmd_factory,
        })
    }

    /// Replace the list of rules to be inserted at the top of the given
    /// chain.  Takes effect at the next apply().
    pub fn set_rule_insertions(&mut self, chain_name: &str, rules: Vec<Rule>) {
        debug!("queueing update of insertions in {}", chain_name);
        self.chain_to_inserted_rules
            .insert(chain_name.to_string(), rules);
        self.dirty_inserts.insert(chain_name.to_string());
    }

    pub fn update_chains(&mut self, chains: Vec<Chain>) {
        for chain in chains {
            self.update_chain(chain);
        }
    }

    /// Install or replace the whole contents of one of our chains.  Takes
    /// effect at the next apply().
    pub fn update_chain(&mut self, chain: Chain) {
        info!("queueing update of chain {}", chain.name);
        self.dirty_chains.insert(chain.name.clone());
        self.chains.insert(chain.name.clone(), chain);
    }

    pub fn remove_chains(&mut self, chains: &[Chain]) {
        for chain in chains {
            self.remove_chain_by_name(&chain.name);
        }
    }

    /// Schedule one of our chains for deletion at the next apply().
    pub fn remove_chain_by_name(&mut self, name: &str) {
        info!("queueing deletion of chain {}", name);
        self.chains.remove(name);
        self.dirty_chains.insert(name.to_string());
    }

    /// Force a fresh scan of the kernel state before the next apply().
    pub fn invalidate_dataplane_cache(&mut self) {
        self.in_sync_with_dataplane = false;
    }

    /// Bring the kernel table in sync with the desired state.  Retries with
    /// exponential backoff; concurrent writers can invalidate the restore
    /// transaction, and losing such a race is routine because the next
    /// attempt re-scans.  After the retry budget is spent the error is
    /// returned and the table should be considered unprogrammed.
    pub fn apply(&mut self) -> RulevarkResult<()> {
        let mut retries = MAX_APPLY_RETRIES;
        let mut backoff = INITIAL_BACKOFF;
        let mut failed_at_least_once = false;
        loop {
            let result = self.attempt_apply();
            match result {
                Ok(()) => {
                    if failed_at_least_once {
                        warn!("table {} v{} succeeded after retry", self.name, self.ip_version);
                    }
                    return Ok(());
                }
                Err(err) => {
                    if retries == 0 {
                        return Err(RulevarkError::wrap(
                            format!(
                                "failed to program table {} v{}, giving up after retries",
                                self.name, self.ip_version
                            ),
                            err,
                        ));
                    }
                    retries -= 1;
                    warn!(
                        "failed to program table {} v{}, will retry in {:?}: {}",
                        self.name, self.ip_version, backoff, err
                    );
                    thread::sleep(backoff);
                    backoff *= 2;
                    failed_at_least_once = true;
                }
            }
        }
    }

    fn attempt_apply(&mut self) -> RulevarkResult<()> {
        if !self.in_sync_with_dataplane {
            // Our picture of the kernel may be stale, refresh it.  This can
            // mark more chains dirty.
            self.load_dataplane_state()?;
        }
        self.apply_updates()
    }

    /// Re-scan the kernel and mark any chain whose contents no longer match
    /// what we believe we programmed.
    fn load_dataplane_state(&mut self) -> RulevarkResult<()> {
        info!(
            "scanning table {} v{} for out-of-sync chains",
            self.name, self.ip_version
        );
        let dataplane_hashes = self.hashes_from_dataplane()?;

        let mut new_dirty_chains: Vec<String> = Vec::new();
        let mut new_dirty_inserts: Vec<String> = Vec::new();
        for (chain_name, expected_hashes) in &self.chain_to_dataplane_hashes {
            if self.dirty_chains.contains(chain_name) {
                debug!("skipping known-dirty chain {}", chain_name);
                continue;
            }
            let dp_hashes = match dataplane_hashes.get(chain_name) {
                Some(hashes) => hashes.as_slice(),
                None => &[],
            };
            if !self.our_chains_re.is_match(chain_name) {
                // Not one of our chains; check whether our insertions at the
                // top of it are intact.
                let expected_rules = match self.chain_to_inserted_rules.get(chain_name) {
                    Some(rules) => rules.as_slice(),
                    None => &[],
                };
                let expected_hashes = ruleset::rule_hashes(chain_name, expected_rules);
                let mut dirty = false;
                if dp_hashes.len() < expected_hashes.len() {
                    info!("chain {} too short to hold all our rules", chain_name);
                    dirty = true;
                } else {
                    let mut seen_foreign_rule = false;
                    let mut num_hashes_seen = 0;
                    for (i, hash) in dp_hashes.iter().enumerate() {
                        if hash.is_empty() {
                            seen_foreign_rule = true;
                            continue;
                        }
                        num_hashes_seen += 1;
                        if seen_foreign_rule {
                            // One of our rules sits below a foreign rule; it
                            // needs re-inserting at the top.
                            info!("our rules in {} have moved", chain_name);
                            dirty = true;
                            break;
                        }
                        if i >= expected_hashes.len() {
                            info!("found extra rule insertions in {}", chain_name);
                            dirty = true;
                            break;
                        }
                        if hash != &expected_hashes[i] {
                            info!("found incorrect rule insertions in {}", chain_name);
                            dirty = true;
                            break;
                        }
                    }
                    if !dirty && num_hashes_seen != expected_hashes.len() {
                        info!("chain {} has wrong number of insertions", chain_name);
                        dirty = true;
                    }
                }
                if dirty {
                    info!("marking insertions in {} for refresh", chain_name);
                    new_dirty_inserts.push(chain_name.clone());
                }
            } else {
                // One of our chains, it must match exactly.
                if dp_hashes != expected_hashes.as_slice()
                    || !dataplane_hashes.contains_key(chain_name)
                {
                    warn!("detected out-of-sync chain {}, marking for resync", chain_name);
                    new_dirty_chains.push(chain_name.clone());
                }
            }
        }
        self.dirty_chains.extend(new_dirty_chains);
        self.dirty_inserts.extend(new_dirty_inserts);

        // Now look for chains of ours that exist in the kernel but that we
        // have no record of; they are left over from a previous run and get
        // scheduled for cleanup.
        for chain_name in dataplane_hashes.keys() {
            if self.dirty_chains.contains(chain_name) || self.dirty_inserts.contains(chain_name) {
                debug!("skipping known-dirty chain {}", chain_name);
                continue;
            }
            if !self.our_chains_re.is_match(chain_name) {
                continue;
            }
            if self.chain_to_dataplane_hashes.contains_key(chain_name) {
                // Expected chain, checked above.
                continue;
            }
            info!("found unexpected chain {}, marking for cleanup", chain_name);
            self.dirty_chains.insert(chain_name.clone());
        }

        debug!("scan done, in sync with dataplane: {:?}", dataplane_hashes);
        self.chain_to_dataplane_hashes = dataplane_hashes;
        self.in_sync_with_dataplane = true;
        Ok(())
    }

    /// Run the save utility for this table and parse out the per-chain rule
    /// identifiers.
    fn hashes_from_dataplane(&self) -> RulevarkResult<HashMap<String, Vec<String>>> {
        let mut cmd = self
            .cmd_factory
            .make_command(self.save_cmd, &["-t", self.name.as_str()]);
        let output = cmd
            .output()
            .wrap(format!("read back table {} v{}", self.name, self.ip_version))?;
        Ok(self.hashes_from_save_output(&String::from_utf8_lossy(&output)))
    }

    /// Parse save-utility output, extracting one identifier per rule slot
    /// for every chain in the table.  Rules we wrote yield the identifier
    /// from their comment; rules from identifier-less old versions yield a
    /// sentinel; foreign rules yield an empty string.  Each chain's sequence
    /// therefore has the chain's full length, whoever wrote the rules.
    fn hashes_from_save_output(&self, save_output: &str) -> HashMap<String, Vec<String>> {
        let mut hashes: HashMap<String, Vec<String>> = HashMap::new();
        for line in save_output.lines() {
            // Forward declarations, ":chain-name - [0:0]"; record the chain
            // even if it turns out to be empty.
            if let Some(captures) = self.chain_create_re.captures(line) {
                hashes.entry(captures[1].to_string()).or_default();
                continue;
            }

            let captures = match self.append_re.captures(line) {
                Some(captures) => captures,
                None => continue,
            };
            let chain_name = captures[1].to_string();

            // We write the identifier as the first comment on each rule, so
            // taking the first match of the regex cannot pick up a comment
            // added by someone else further along the line.
            let hash = if let Some(captures) = self.hash_comment_re.captures(line) {
                captures[1].to_string()
            } else if self.old_insert_re.is_match(line) {
                info!(
                    "found legacy insertion in {}, marking for cleanup: {}",
                    chain_name, line
                );
                OLD_INSERT_SENTINEL.to_string()
            } else {
                String::new()
            };
            hashes.entry(chain_name).or_default().push(hash);
        }
        hashes
    }

    /// Build and commit one restore transaction covering everything that is
    /// dirty.  On success the believed dataplane state and dirty sets are
    /// updated; on failure the cache is invalidated and the dirty sets are
    /// left as they were so a retry regenerates the script.
    fn apply_updates(&mut self) -> RulevarkResult<()> {
        let table_name_line = format!("*{}\n", self.name);
        let mut input = table_name_line.clone();

        // First pass: emit a forward reference (which also flushes) for
        // every dirty chain that is about to be deleted or that doesn't
        // exist in the kernel yet.  Flushing before deletion severs any
        // references from other chains being deleted in the same
        // transaction.
        for chain_name in &self.dirty_chains {
            let needs_flush = !self.chains.contains_key(chain_name)
                || !self.chain_to_dataplane_hashes.contains_key(chain_name);
            if needs_flush {
                input.push_str(&format!(":{} - -\n", chain_name));
            }
        }

        // Second pass: diff each dirty chain we own against the identifiers
        // we believe are in the kernel, emitting the smallest set of
        // replace/delete/append lines.  Slots whose identifier is unchanged
        // emit nothing at all, which keeps their packet counters.
        let mut new_hashes: HashMap<String, Option<Vec<String>>> = HashMap::new();
        for chain_name in &self.dirty_chains {
            let chain = match self.chains.get(chain_name) {
                Some(chain) => chain,
                None => continue, // deletion, handled in the last pass
            };
            let previous_hashes = match self.chain_to_dataplane_hashes.get(chain_name) {
                Some(hashes) => hashes.as_slice(),
                None => &[],
            };
            let current_hashes = chain.rule_hashes();
            for i in 0..previous_hashes.len().max(current_hashes.len()) {
                let line = if i < previous_hashes.len() && i < current_hashes.len() {
                    if previous_hashes[i] == current_hashes[i] {
                        continue;
                    }
                    let prefix_frag = self.comment_frag(&current_hashes[i]);
                    chain.rules[i].render_replace(chain_name, i + 1, &prefix_frag)
                } else if i < previous_hashes.len() {
                    // The chain shrank; every delete targets the slot just
                    // past the desired length because earlier deletes in
                    // this loop have already closed up the tail.
                    delete_rule(chain_name, current_hashes.len() + 1)
                } else {
                    let prefix_frag = self.comment_frag(&current_hashes[i]);
                    chain.rules[i].render_append(chain_name, &prefix_frag)
                };
                input.push_str(&line);
                input.push('\n');
            }
            new_hashes.insert(chain_name.clone(), Some(current_hashes));
        }

        // Third pass: per-chain insertions.  If anything is off we tear out
        // all our rules from the chain and re-insert them at the top, in
        // reverse so the final order matches.  Foreign rules are left where
        // they are.
        for chain_name in &self.dirty_inserts {
            let previous_hashes = match self.chain_to_dataplane_hashes.get(chain_name) {
                Some(hashes) => hashes.as_slice(),
                None => &[],
            };
            let rules = match self.chain_to_inserted_rules.get(chain_name) {
                Some(rules) => rules.as_slice(),
                None => &[],
            };
            let mut current_hashes = ruleset::rule_hashes(chain_name, rules);

            let mut needs_rewrite = false;
            if previous_hashes.len() < current_hashes.len()
                || previous_hashes[..current_hashes.len()] != current_hashes[..]
            {
                info!("insertions in {} changed, updating", chain_name);
                needs_rewrite = true;
            } else {
                // Our rules are intact at the top; any stray rule of ours
                // further down still forces a rewrite.
                for hash in &previous_hashes[current_hashes.len()..] {
                    if !hash.is_empty() {
                        info!("chain {} contains old rule insertion, updating", chain_name);
                        needs_rewrite = true;
                        break;
                    }
                }
            }
            if !needs_rewrite {
                continue;
            }

            // Delete in reverse order so rule numbers stay valid while we
            // go.  Empty slots are foreign rules that survive, so the
            // recorded sequence grows one empty entry for each.
            for i in (0..previous_hashes.len()).rev() {
                if previous_hashes[i].is_empty() {
                    current_hashes.push(String::new());
                } else {
                    input.push_str(&delete_rule(chain_name, i + 1));
                    input.push('\n');
                }
            }
            for i in (0..rules.len()).rev() {
                let prefix_frag = self.comment_frag(&current_hashes[i]);
                input.push_str(&rules[i].render_insert(chain_name, &prefix_frag));
                input.push('\n');
            }
            new_hashes.insert(chain_name.clone(), Some(current_hashes));
        }

        // Last pass: chain deletions.  References to these chains were
        // removed by the earlier passes (or severed by the flush in the
        // first pass), so the kernel accepts the delete.
        for chain_name in &self.dirty_chains {
            if !self.chains.contains_key(chain_name) {
                input.push_str(&format!("--delete-chain {}\n", chain_name));
                new_hashes.insert(chain_name.clone(), None);
            }
        }

        if input.len() > table_name_line.len() {
            input.push_str("COMMIT\n");
            debug!("writing to {}:\n{}", self.restore_cmd, input);

            let mut cmd = self
                .cmd_factory
                .make_command(self.restore_cmd, &["--noflush", "--verbose"]);
            cmd.set_stdin(input.clone());
            match cmd.run() {
                Ok(result) if result.success => {}
                Ok(result) => {
                    // Keep the full script in the log for post-mortems.
                    warn!(
                        "{} failed, stderr: {} input:\n{}",
                        self.restore_cmd,
                        String::from_utf8_lossy(&result.stderr),
                        input
                    );
                    self.in_sync_with_dataplane = false;
                    return Err(RulevarkError::Command {
                        program: self.restore_cmd.to_string(),
                        stderr: String::from_utf8_lossy(&result.stderr).into_owned(),
                    });
                }
                Err(err) => {
                    warn!("failed to execute {}: {}", self.restore_cmd, err);
                    self.in_sync_with_dataplane = false;
                    return Err(err);
                }
            }
        }

        // The kernel now matches the desired state, clear the dirty sets.
        // This also covers dirty chains that turned out to need no changes.
        self.dirty_chains.clear();
        self.dirty_inserts.clear();

        for (chain_name, hashes) in new_hashes {
            match hashes {
                Some(hashes) => {
                    self.chain_to_dataplane_hashes.insert(chain_name, hashes);
                }
                None => {
                    self.chain_to_dataplane_hashes.remove(&chain_name);
                }
            }
        }
        Ok(())
    }

    fn comment_frag(&self, hash: &str) -> String {
        format!(
            "-m comment --comment \"{}{}\"",
            self.hash_comment_prefix, hash
        )
    }
}

fn delete_rule(chain_name: &str, rule_num: usize) -> String {
    format!("-D {} {}", chain_name, rule_num)
}
