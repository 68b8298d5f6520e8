// examples/ruleset_lifecycle_usage.rs
//
// Walks a RuleSet through compilation and publishing: a first good build,
// an unchanged rebuild, a conflicting edit that is rejected while the last
// good version keeps serving, and the history afterwards.
//
// Run with: cargo run --example ruleset_lifecycle_usage

use rule_engine::{
    ObjectReference, PublishOutcome, RuleSet, RuleSetCompiler, RuleSource, SourceRef,
    VersionStore,
};

fn source(name: &str, content: &str) -> RuleSource {
    match RuleSource::new(SourceRef::config_map(name), content) {
        Ok(source) => source,
        Err(e) => panic!("example source {name} rejected: {e}"),
    }
}

fn main() {
    println!("=== RuleSet Lifecycle ===\n");

    // ========================================================================
    // Example 1: Validate the resource
    // ========================================================================
    println!("Example 1: RuleSet resource");
    println!("--------------------------");

    let rule_set = RuleSet::new(
        "waf",
        "default-rules",
        vec![
            ObjectReference::config_map("base"),
            ObjectReference::config_map("custom"),
        ],
    );
    println!("RuleSet {}/{}", rule_set.namespace(), rule_set.name());
    println!("  Validation: {:?}", rule_set.validate());
    println!();

    // ========================================================================
    // Example 2: Compile and publish
    // ========================================================================
    println!("Example 2: First compilation");
    println!("--------------------------");

    let compiler = RuleSetCompiler::new();
    let store = VersionStore::new();

    let base = source("base", "SecRuleEngine On\nSecRule ARGS \"@rx attack\" \"id:1001,phase:2,deny\"\n");
    let custom = source("custom", "SecRule REQUEST_URI \"@beginsWith /admin\" \"id:2001,phase:1,deny\"\n");

    let record = compiler
        .compile_record(1, &[base.clone(), custom])
        .unwrap_or_else(|e| panic!("compile failed: {e}"));
    println!("Fingerprint: {}", record.fingerprint());
    println!("Publish: {:?}", store.publish(record));
    println!();

    // ========================================================================
    // Example 3: Recompile with identical inputs
    // ========================================================================
    println!("Example 3: Unchanged rebuild");
    println!("--------------------------");

    let again = compiler
        .compile_record(2, &[base.clone(), source("custom", "SecRule REQUEST_URI \"@beginsWith /admin\" \"id:2001,phase:1,deny\"\n")])
        .unwrap_or_else(|e| panic!("compile failed: {e}"));
    let outcome = store.publish(again);
    println!("Publish: {outcome:?}");
    assert_eq!(outcome, Ok(PublishOutcome::Unchanged));
    println!();

    // ========================================================================
    // Example 4: Conflicting edit keeps the last good version
    // ========================================================================
    println!("Example 4: Conflicting edit");
    println!("--------------------------");

    let conflicting = source("custom", "SecRule ARGS \"@rx other\" \"id:1001,phase:2,pass\"\n");
    let rejected = compiler
        .compile_record(3, &[base, conflicting])
        .unwrap_or_else(|e| panic!("compile failed: {e}"));
    println!("Valid: {}", rejected.is_valid());
    println!("Reason: {}", rejected.reason().unwrap_or_default());
    println!("Publish: {:?}", store.publish(rejected));

    match store.read_current() {
        Ok(current) => println!(
            "Still serving generation {} ({})",
            current.generation(),
            current.fingerprint()
        ),
        Err(e) => println!("Nothing to serve: {e}"),
    }
    println!();

    // ========================================================================
    // Example 5: History
    // ========================================================================
    println!("Example 5: History");
    println!("--------------------------");
    for entry in store.history(10) {
        println!(
            "  gen {} {} ({} sources, compiled {})",
            entry.generation(),
            entry.fingerprint(),
            entry.ruleset().source_count(),
            entry.ruleset().compiled_at
        );
    }
}
