//! Rewrite Engine Invariant Tests
//!
//! Proves the core guarantees of security rewriting:
//! 1. Restriction-only: rewriting never widens a query
//! 2. Idempotence: re-rewriting an already-guarded query adds nothing
//! 3. Rollback safety: a refused query is returned untouched
//! 4. Optional relations survive as IS NULL / subquery correlation
//! 5. Pending permission obligations resolve through the target's types
//! 6. Under-constrained splices split into type-pinned variantes

use std::collections::BTreeSet;

use uuid::Uuid;

use rowgate::ast::{Solution, Union};
use rowgate::parser::parse_query;
use rowgate::schema::{Action, Schema};
use rowgate::session::{Params, SessionContext};
use rowgate::solver::annotate;
use rowgate::{QueryRewriter, RewriteError, RewriteEvent};

fn blog_schema() -> Schema {
    let mut schema = Schema::new("blog");
    schema.add_entity("BlogEntry").unwrap();
    schema.add_entity("Note").unwrap();
    schema.add_entity("State").unwrap();
    schema.add_entity("CWUser").unwrap();
    schema
        .add_relation("in_state", "BlogEntry", "State", "?*")
        .unwrap();
    schema
        .add_relation("in_state", "Note", "State", "?*")
        .unwrap();
    schema.add_attribute("name", "State", "String").unwrap();
    schema.add_attribute("title", "BlogEntry", "String").unwrap();
    schema
        .add_relation("owned_by", "BlogEntry", "CWUser", "**")
        .unwrap();
    schema
        .add_relation("owned_by", "Note", "CWUser", "**")
        .unwrap();
    schema
}

fn solved(text: &str, schema: &Schema) -> Union {
    let mut union = parse_query(text).unwrap();
    annotate(&mut union, schema).unwrap();
    union
}

/// Solutions of every branch, projected onto the given variables.
fn projected(union: &Union, vars: &BTreeSet<String>) -> BTreeSet<Solution> {
    union
        .branches
        .iter()
        .flat_map(|b| b.solutions.iter())
        .map(|solution| {
            solution
                .iter()
                .filter(|(var, _)| vars.contains(*var))
                .map(|(var, t)| (var.clone(), t.clone()))
                .collect()
        })
        .collect()
}

// =============================================================================
// RESTRICTION-ONLY PROPERTY
// =============================================================================

/// Test: the rewritten query's typed solutions, projected onto the
/// original variables, equal the original's exactly.
#[test]
fn test_rewrite_preserves_original_typed_solutions() {
    let mut schema = blog_schema();
    schema
        .guard(
            "BlogEntry",
            Action::Read,
            &["X in_state S, S name \"published\""],
        )
        .unwrap();
    let queries = [
        "Any X WHERE X is BlogEntry",
        "Any X WHERE X in_state S",
        "Any X, T WHERE X title T",
    ];
    for text in queries {
        let original = solved(text, &schema);
        let vars: BTreeSet<String> = original
            .branches
            .iter()
            .flat_map(|b| b.variables())
            .collect();
        let before = projected(&original, &vars);

        let mut union = original.clone();
        let mut params = Params::new();
        QueryRewriter::new(&schema)
            .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
            .unwrap();
        assert_eq!(projected(&union, &vars), before, "query: {}", text);
    }
}

// =============================================================================
// IDEMPOTENCE
// =============================================================================

/// Test: rewriting twice yields the same tree and solutions as once.
#[test]
fn test_rewrite_is_idempotent() {
    let mut schema = blog_schema();
    schema
        .guard(
            "BlogEntry",
            Action::Read,
            &["X in_state S, S name \"published\""],
        )
        .unwrap();
    let mut union = solved("Any X WHERE X is BlogEntry", &schema);
    let mut params = Params::new();
    let rewriter = QueryRewriter::new(&schema);
    rewriter
        .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
        .unwrap();
    let once = union.clone();
    rewriter
        .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
        .unwrap();
    assert_eq!(union.to_string(), once.to_string());
    assert_eq!(union.solution_count(), once.solution_count());
}

// =============================================================================
// TAUTOLOGY AND SCENARIO SHAPES
// =============================================================================

/// Test: a rule tautological relative to bound variables wraps the query
/// in a bare EXISTS with no ambiguity branches.
#[test]
fn test_tautology_rule_produces_plain_exists() {
    let mut schema = blog_schema();
    schema
        .guard("BlogEntry", Action::Read, &["X eid %(x)s"])
        .unwrap();
    let mut union = solved("Any X WHERE X is BlogEntry", &schema);
    let mut params = Params::new();
    params.insert("x".to_string(), serde_json::json!(7));
    let events = QueryRewriter::new(&schema)
        .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
        .unwrap();
    assert_eq!(
        union.to_string(),
        "Any X WHERE X is BlogEntry, EXISTS(X eid %(x)s)"
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, RewriteEvent::AmbiguitySplit { .. })));
}

/// Test: the canonical published-state scenario.
#[test]
fn test_published_state_scenario() {
    let mut schema = blog_schema();
    schema
        .guard(
            "BlogEntry",
            Action::Read,
            &["X in_state S, S name \"published\""],
        )
        .unwrap();
    let mut union = solved("Any X WHERE X is BlogEntry", &schema);
    let mut params = Params::new();
    QueryRewriter::new(&schema)
        .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
        .unwrap();
    assert_eq!(
        union.to_string(),
        "Any X WHERE X is BlogEntry, EXISTS(X in_state S, S name \"published\")"
    );
}

// =============================================================================
// ROLLBACK SAFETY
// =============================================================================

/// Test: no satisfiable rule for an action leaves the query untouched and
/// the caller holds `Unauthorized`.
#[test]
fn test_unauthorized_is_rollback_safe() {
    let mut schema = blog_schema();
    // Only a user-dependent rule, and the session is anonymous.
    schema
        .guard("BlogEntry", Action::Delete, &["X owned_by U"])
        .unwrap();
    let mut union = solved("Any X WHERE X is BlogEntry", &schema);
    let before_tree = union.to_string();
    let before_solutions = union.branches[0].solutions.clone();
    let mut params = Params::new();
    let err = QueryRewriter::new(&schema)
        .enforce(&mut union, Action::Delete, &SessionContext::anonymous(), &mut params)
        .unwrap_err();
    assert!(matches!(err, RewriteError::Unauthorized));
    assert_eq!(union.to_string(), before_tree);
    assert_eq!(union.branches[0].solutions, before_solutions);
    assert!(params.is_empty());
}

// =============================================================================
// USER BINDING
// =============================================================================

/// Test: `U` maps to one allocated variable with the user's eid bound as
/// a parameter exactly once, even across several rules.
#[test]
fn test_user_variable_bound_once() {
    let mut schema = blog_schema();
    schema
        .guard(
            "BlogEntry",
            Action::Read,
            &["X owned_by U", "X in_state S, S name \"published\""],
        )
        .unwrap();
    let user = Uuid::new_v4();
    let mut union = solved("Any X WHERE X is BlogEntry", &schema);
    let mut params = Params::new();
    QueryRewriter::new(&schema)
        .enforce(
            &mut union,
            Action::Read,
            &SessionContext::authenticated(user),
            &mut params,
        )
        .unwrap();
    assert_eq!(params.len(), 1);
    assert_eq!(
        params.get("u"),
        Some(&serde_json::Value::String(user.to_string()))
    );
    let text = union.to_string();
    assert_eq!(text.matches("%(u)s").count(), 1);
}

// =============================================================================
// OPTIONAL RELATIONS
// =============================================================================

/// Test: a guarded variable reached through an outer join is protected
/// with an IS NULL fallback and a correlated subquery, never a plain
/// EXISTS that would drop relation-less rows.
#[test]
fn test_optional_variable_keeps_is_null_fallback() {
    let mut schema = blog_schema();
    schema.add_entity("Card").unwrap();
    schema
        .add_relation("described_by", "Card", "Note", "?*")
        .unwrap();
    schema
        .guard("Note", Action::Read, &["X owned_by U"])
        .unwrap();
    let mut union = solved("Any X, N WHERE X described_by N?", &schema);
    let before_solutions = union.branches[0].solutions.clone();
    let mut params = Params::new();
    let events = QueryRewriter::new(&schema)
        .enforce(
            &mut union,
            Action::Read,
            &SessionContext::authenticated(Uuid::new_v4()),
            &mut params,
        )
        .unwrap();
    let text = union.to_string();
    assert!(text.contains("N is NULL OR N IN ("), "got: {}", text);
    assert!(!text.contains("EXISTS(N"), "got: {}", text);
    assert_eq!(union.branches[0].solutions, before_solutions);
    assert!(events
        .iter()
        .any(|e| matches!(e, RewriteEvent::SubqueryExtracted { variable } if variable == "N")));
}

// =============================================================================
// PENDING PERMISSION OBLIGATIONS
// =============================================================================

/// Test: `has_read_permission` in a snippet defers to the target type's
/// own read rules, resolved once the target's type is known.
#[test]
fn test_permission_relation_resolved_through_target_rules() {
    let mut schema = blog_schema();
    schema.add_entity("Comment").unwrap();
    schema
        .add_relation("comment_of", "Comment", "BlogEntry", "1*")
        .unwrap();
    schema
        .guard(
            "BlogEntry",
            Action::Read,
            &["X in_state S, S name \"published\""],
        )
        .unwrap();
    schema
        .guard(
            "Comment",
            Action::Read,
            &["X comment_of B, U has_read_permission B"],
        )
        .unwrap();
    let mut union = solved("Any C WHERE C is Comment", &schema);
    let mut params = Params::new();
    QueryRewriter::new(&schema)
        .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
        .unwrap();
    let text = union.to_string();
    // The comment is visible only through a published blog entry.
    assert!(text.contains("C comment_of B"), "got: {}", text);
    assert!(
        text.contains("EXISTS(B in_state S, S name \"published\")"),
        "got: {}",
        text
    );
}

/// Test: a guard assembled from permission obligations is recognized on
/// a second pass. The raw snippet carries no body of its own, so the
/// comparison must use the fully resolved condition.
#[test]
fn test_permission_relation_guard_is_idempotent() {
    let mut schema = blog_schema();
    schema.add_entity("Comment").unwrap();
    schema
        .add_relation("comment_of", "Comment", "BlogEntry", "1*")
        .unwrap();
    schema
        .guard(
            "BlogEntry",
            Action::Read,
            &["X in_state S, S name \"published\""],
        )
        .unwrap();
    schema
        .guard(
            "Comment",
            Action::Read,
            &["X comment_of B, U has_read_permission B"],
        )
        .unwrap();
    let mut union = solved("Any C WHERE C is Comment", &schema);
    let mut params = Params::new();
    let rewriter = QueryRewriter::new(&schema);
    rewriter
        .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
        .unwrap();
    let once = union.to_string();
    let events = rewriter
        .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
        .unwrap();
    assert_eq!(union.to_string(), once);
    assert!(events
        .iter()
        .any(|e| matches!(e, RewriteEvent::AlreadyGuarded { variable } if variable == "C")));
    assert!(!events
        .iter()
        .any(|e| matches!(e, RewriteEvent::RuleApplied { .. })));
}

/// Test: mutually recursive permission rules are a schema defect, not an
/// infinite loop.
#[test]
fn test_recursive_permission_rules_rejected() {
    let mut schema = blog_schema();
    schema.add_entity("Comment").unwrap();
    schema
        .add_relation("comment_of", "Comment", "Comment", "?*")
        .unwrap();
    schema
        .guard(
            "Comment",
            Action::Read,
            &["X comment_of B, U has_read_permission B"],
        )
        .unwrap();
    let mut union = solved("Any C WHERE C is Comment", &schema);
    let mut params = Params::new();
    let err = QueryRewriter::new(&schema)
        .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
        .unwrap_err();
    assert!(matches!(err, RewriteError::BadSchemaDefinition { .. }));
}

// =============================================================================
// AMBIGUITY RESOLUTION
// =============================================================================

/// Test: a snippet variable admitting several types splits the spliced
/// EXISTS into one type-pinned branch per variante, and the original
/// variables' typings survive.
#[test]
fn test_ambiguous_new_variable_splits_into_variantes() {
    let mut schema = blog_schema();
    schema
        .add_relation("linked_to", "BlogEntry", "Note", "**")
        .unwrap();
    schema
        .add_relation("linked_to", "BlogEntry", "State", "**")
        .unwrap();
    schema
        .guard("BlogEntry", Action::Read, &["X linked_to L"])
        .unwrap();
    let mut union = solved("Any X WHERE X is BlogEntry", &schema);
    let mut params = Params::new();
    let events = QueryRewriter::new(&schema)
        .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
        .unwrap();
    assert!(events
        .iter()
        .any(|e| matches!(e, RewriteEvent::AmbiguitySplit { variables } if variables == &vec!["L".to_string()])));
    let text = union.to_string();
    assert!(text.contains("L is Note"), "got: {}", text);
    assert!(text.contains("L is State"), "got: {}", text);
    // Projection onto the original variable is unchanged.
    let vars: BTreeSet<String> = ["X".to_string()].into_iter().collect();
    let remaining = projected(&union, &vars);
    assert_eq!(remaining.len(), 1);
}

/// Test: two new variables whose types vary together are pinned as pairs.
/// Pinning them independently would admit type combinations no real
/// solution has.
#[test]
fn test_correlated_new_variables_pinned_together() {
    let mut schema = blog_schema();
    schema
        .add_relation("about", "BlogEntry", "Note", "**")
        .unwrap();
    schema
        .add_relation("about", "BlogEntry", "State", "**")
        .unwrap();
    schema.add_relation("backs", "Note", "Note", "**").unwrap();
    schema.add_relation("backs", "State", "State", "**").unwrap();
    schema
        .guard("BlogEntry", Action::Read, &["X about A, A backs B"])
        .unwrap();
    let mut union = solved("Any X WHERE X is BlogEntry", &schema);
    let mut params = Params::new();
    QueryRewriter::new(&schema)
        .enforce(&mut union, Action::Read, &SessionContext::anonymous(), &mut params)
        .unwrap();
    let text = union.to_string();
    assert!(
        text.contains("EXISTS(X about A, A backs B, A is Note, B is Note)"),
        "got: {}",
        text
    );
    assert!(
        text.contains("EXISTS(X about A, A backs B, A is State, B is State)"),
        "got: {}",
        text
    );
    assert!(!text.contains("A is Note, B is State"), "got: {}", text);
    assert!(!text.contains("A is State, B is Note"), "got: {}", text);
}
