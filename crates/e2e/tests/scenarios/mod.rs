//! Scenario corpus run by the `e2e` suite binary

use reqwest::Method;
use serde_json::{json, Value};

use arbor_common::{NodeType, Role, Visibility};
use arbor_e2e::results::note_exchange;
use arbor_e2e::{contains_id, ensure_that, require_status, E2eError, E2eResult, Fixture, JsonExt, TestCase};

pub const ALL: &[TestCase] = &[
    TestCase::new("Server.startup", server_startup),
    TestCase::new("Server.security_headers", server_security_headers),
    TestCase::new("Server.unknown_route", server_unknown_route),
    TestCase::new("Auth.register_round_trip", auth_register_round_trip),
    TestCase::new("Auth.duplicate_handle", auth_duplicate_handle),
    TestCase::new("Auth.validation", auth_validation),
    TestCase::new("Auth.wrong_password", auth_wrong_password),
    TestCase::new("Auth.me_requires_token", auth_me_requires_token),
    TestCase::new("Auth.sql_injection_handle", auth_sql_injection_handle),
    TestCase::new("Authz.role_coherence", authz_role_coherence),
    TestCase::new("Nodes.ask_persists", nodes_ask_persists),
    TestCase::new("Nodes.answer_links_parent", nodes_answer_links_parent),
    TestCase::new("Nodes.soft_delete", nodes_soft_delete),
    TestCase::new("Nodes.delete_requires_author", nodes_delete_requires_author),
    TestCase::new("Nodes.tree_depth", nodes_tree_depth),
    TestCase::new("Nodes.clone_linkage", nodes_clone_linkage),
    TestCase::new("Visibility.strata_ladder", visibility_strata_ladder),
    TestCase::new("Visibility.role_gates_reads", visibility_role_gates_reads),
    TestCase::new("Flows.ask_records_steps", flows_ask_records_steps),
    TestCase::new("Bot.answer_with_llm", bot_answer_with_llm),
    TestCase::new("Bot.answer_without_llm", bot_answer_without_llm),
];

/// Handle unique to this run, within the 32-char limit.
fn unique_handle(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &id[..8])
}

const PASSWORD: &str = "e2e-password-1234";

// ============================================================================
// Server
// ============================================================================

fn server_startup(fx: &Fixture) -> E2eResult<()> {
    let harness = &fx.harness;
    let port = harness.port();
    ensure_that!(port > 0, "port {} out of range", port);
    ensure_that!(
        harness.base_url() == format!("https://127.0.0.1:{}", port),
        "unexpected base url {}",
        harness.base_url()
    );
    ensure_that!(harness.data_dir().is_dir(), "data dir missing");
    ensure_that!(harness.config_path().is_file(), "config file missing");

    let resp = harness.get("/api/bot/status", None)?;
    require_status(&resp, 200)?;
    let status = resp.value()?;
    ensure_that!(status.require_bool("enabled")?, "bot not enabled: {}", status);
    status.require_str("handle")?;
    ensure_that!(
        status.require_bool("has_llm")? == harness.has_llm(),
        "has_llm disagrees with harness"
    );
    Ok(())
}

fn server_security_headers(fx: &Fixture) -> E2eResult<()> {
    let resp = fx.harness.get("/api/bot/status", None)?;
    for name in [
        "content-security-policy",
        "x-content-type-options",
        "x-frame-options",
        "referrer-policy",
        "permissions-policy",
    ] {
        ensure_that!(resp.header(name).is_some(), "missing header {}", name);
    }
    ensure_that!(resp.header("x-content-type-options") == Some("nosniff"), "nosniff");
    ensure_that!(resp.header("x-frame-options") == Some("DENY"), "frame options");
    ensure_that!(
        resp.header("referrer-policy") == Some("strict-origin-when-cross-origin"),
        "referrer policy"
    );

    // Error responses carry them too.
    let missing = fx.harness.get("/api/does-not-exist", None)?;
    ensure_that!(
        missing.header("x-frame-options") == Some("DENY"),
        "headers missing on 404"
    );
    Ok(())
}

fn server_unknown_route(fx: &Fixture) -> E2eResult<()> {
    let resp = fx.harness.get("/api/does-not-exist", None)?;
    require_status(&resp, 404)?;
    resp.value()?.require_str("error")?;
    Ok(())
}

// ============================================================================
// Auth
// ============================================================================

fn auth_register_round_trip(fx: &Fixture) -> E2eResult<()> {
    let session = fx.harness.register("alice", "alice-pass-1234")?;
    ensure_that!(!session.token.is_empty(), "empty token");
    ensure_that!(!session.user_id.is_empty(), "empty user id");

    let me = fx.harness.me(&session.token)?;
    ensure_that!(me.str_at("handle") == Some("alice"), "me: {}", me);
    ensure_that!(me.str_at("role") == Some("user"), "me: {}", me);
    ensure_that!(me.str_at("id") == Some(session.user_id.as_str()), "me: {}", me);

    fx.inspector
        .assert_row_count("users", "handle = ?1 AND role = 'user'", &[&"alice"], 1)?;

    let again = fx.harness.login("alice", "alice-pass-1234")?;
    ensure_that!(again.user_id == session.user_id, "login returned another user");
    Ok(())
}

fn auth_duplicate_handle(fx: &Fixture) -> E2eResult<()> {
    let handle = unique_handle("dup");
    fx.harness.register(&handle, PASSWORD)?;
    let resp = fx.harness.post(
        "/api/register",
        &json!({ "handle": handle, "password": PASSWORD }),
        None,
    )?;
    require_status(&resp, 409)?;
    fx.inspector.assert_row_count("users", "handle = ?1", &[&handle], 1)
}

fn auth_validation(fx: &Fixture) -> E2eResult<()> {
    let cases = [
        json!({ "handle": "ab", "password": PASSWORD }),
        json!({ "handle": "has space", "password": PASSWORD }),
        json!({ "handle": unique_handle("short"), "password": "short" }),
        json!({ "handle": "x".repeat(33), "password": PASSWORD }),
    ];
    for body in &cases {
        let resp = fx.harness.post("/api/register", body, None)?;
        require_status(&resp, 400)?;
    }

    let resp = fx.harness.raw_body(Method::POST, "/api/register", None, None)?.0;
    ensure_that!(
        resp.status() >= 400 && resp.status() < 500,
        "missing body accepted with {}",
        resp.status()
    );
    Ok(())
}

fn auth_wrong_password(fx: &Fixture) -> E2eResult<()> {
    let handle = unique_handle("pw");
    fx.harness.register(&handle, PASSWORD)?;
    let resp = fx.harness.post(
        "/api/login",
        &json!({ "handle": handle, "password": "not-the-password" }),
        None,
    )?;
    require_status(&resp, 401)?;

    let resp = fx.harness.post(
        "/api/login",
        &json!({ "handle": unique_handle("ghost"), "password": PASSWORD }),
        None,
    )?;
    require_status(&resp, 401)
}

fn auth_me_requires_token(fx: &Fixture) -> E2eResult<()> {
    require_status(&fx.harness.get("/api/me", None)?, 401)?;
    require_status(&fx.harness.get("/api/me", Some("not-a-jwt"))?, 401)
}

fn auth_sql_injection_handle(fx: &Fixture) -> E2eResult<()> {
    let handle = "x'; DROP TABLE users;--";
    let resp = fx.harness.post(
        "/api/register",
        &json!({ "handle": handle, "password": PASSWORD }),
        None,
    )?;
    // Either rejecting or storing the literal handle is acceptable; the log
    // keeps which one this server chose.
    note_exchange(
        json!({ "method": "POST", "path": "/api/register", "handle": handle }),
        json!({ "observed_status": resp.status(), "body": resp.to_record()["body"].clone() }),
    );
    ensure_that!(
        resp.status() == 201 || resp.status() == 400,
        "unexpected status {}",
        resp.status()
    );
    fx.inspector.assert_row_count_at_least("users", "", &[], 0)?;
    Ok(())
}

fn authz_role_coherence(fx: &Fixture) -> E2eResult<()> {
    let handle = unique_handle("op");
    let session = fx.harness.register(&handle, PASSWORD)?;
    ensure_that!(fx.harness.me(&session.token)?.str_at("role") == Some("user"), "initial role");

    fx.inspector
        .exec("UPDATE users SET role = 'operator' WHERE handle = ?1", &[&handle])?;
    ensure_that!(fx.inspector.user_role(&handle)? == Role::Operator, "role not stored");

    let relogin = fx.harness.login(&handle, PASSWORD)?;
    let me = fx.harness.me(&relogin.token)?;
    ensure_that!(me.str_at("role") == Some("operator"), "me after promotion: {}", me);

    let bogus = unique_handle("admin");
    let insert = fx.inspector.exec(
        "INSERT INTO users (id, handle, password_hash, role) VALUES (?1, ?2, 'x', 'admin')",
        &[&bogus, &bogus],
    );
    match insert {
        Err(E2eError::Sql { source, .. }) if source.to_string().contains("CHECK") => {}
        other => {
            return Err(E2eError::assertion(format!(
                "role 'admin' should violate the CHECK constraint, got {:?}",
                other
            )))
        }
    }
    fx.inspector.assert_row_count("users", "handle = ?1", &[&bogus], 0)
}

// ============================================================================
// Nodes
// ============================================================================

fn nodes_ask_persists(fx: &Fixture) -> E2eResult<()> {
    let session = fx.harness.register(&unique_handle("ask"), PASSWORD)?;
    let id = fx
        .harness
        .ask_question(&session.token, "Does the ask endpoint persist nodes?", &["e2e", "ask"])?;

    fx.inspector.assert_node_exists(&id)?;
    fx.inspector.assert_node_field(&id, "type", &"claim")?;
    fx.inspector.assert_node_field(&id, "depth", &0i64)?;
    fx.inspector.assert_node_field(&id, "author_id", &session.user_id)?;
    fx.inspector
        .assert_row_count("nodes", "id = ?1 AND slug IS NOT NULL AND parent_id IS NULL", &[&id], 1)?;

    let node = fx.harness.get_node(&id)?;
    ensure_that!(node.str_at("body") == Some("Does the ask endpoint persist nodes?"), "{}", node);
    ensure_that!(node.array_at("tags").map(Vec::len) == Some(2), "tags: {}", node);
    Ok(())
}

fn nodes_answer_links_parent(fx: &Fixture) -> E2eResult<()> {
    let session = fx.harness.register(&unique_handle("ans"), PASSWORD)?;
    let root = fx.harness.ask_question(&session.token, "Parent question", &[])?;
    let child = fx
        .harness
        .answer_node(&session.token, &root, "A supporting piece", NodeType::Piece)?;
    let grandchild = fx
        .harness
        .answer_node(&session.token, &child, "A nested claim", NodeType::Claim)?;

    fx.inspector.assert_node_field(&child, "parent_id", &root)?;
    fx.inspector.assert_node_field(&child, "depth", &1i64)?;
    fx.inspector.assert_node_field(&grandchild, "depth", &2i64)?;
    fx.inspector.assert_node_field(&grandchild, "type", &"claim")?;
    fx.inspector.assert_node_field_at_least(&grandchild, "depth", 1)?;
    fx.inspector.assert_row_count("nodes", "parent_id = ?1", &[&root], 1)?;

    let resp = fx.harness.post(
        "/api/answer",
        &json!({ "parent_id": root, "body": "bad type", "type": "opinion" }),
        Some(session.token.as_str()),
    )?;
    require_status(&resp, 400)?;

    let resp = fx.harness.post(
        "/api/answer",
        &json!({ "parent_id": "no-such-node", "body": "orphan" }),
        Some(session.token.as_str()),
    )?;
    require_status(&resp, 404)
}

fn nodes_soft_delete(fx: &Fixture) -> E2eResult<()> {
    let session = fx.harness.register(&unique_handle("del"), PASSWORD)?;
    let id = fx
        .harness
        .ask_question(&session.token, "Delete own node test question", &[])?;
    ensure_that!(
        contains_id(&fx.harness.list_questions(None)?, &id),
        "new question not listed"
    );

    require_status(&fx.harness.delete_node(&session.token, &id)?, 200)?;
    ensure_that!(
        !contains_id(&fx.harness.list_questions(None)?, &id),
        "deleted question still listed"
    );
    require_status(&fx.harness.get(&format!("/api/node/{}", id), None)?, 404)?;

    fx.inspector.assert_node_exists(&id)?;
    ensure_that!(
        fx.inspector.node_deleted_at(&id)?.is_some(),
        "deleted_at not set on {}",
        id
    );
    fx.inspector
        .assert_row_count("nodes", "id = ?1 AND deleted_at IS NOT NULL", &[&id], 1)
}

fn nodes_delete_requires_author(fx: &Fixture) -> E2eResult<()> {
    let owner = fx.harness.register(&unique_handle("own"), PASSWORD)?;
    let other_handle = unique_handle("oth");
    let other = fx.harness.register(&other_handle, PASSWORD)?;
    let id = fx.harness.ask_question(&owner.token, "Only my author may delete me", &[])?;

    require_status(&fx.harness.delete_node(&other.token, &id)?, 403)?;
    ensure_that!(fx.inspector.node_deleted_at(&id)?.is_none(), "deleted by non-author");

    fx.inspector.set_user_role(&other_handle, Role::Operator)?;
    require_status(&fx.harness.delete_node(&other.token, &id)?, 200)?;
    ensure_that!(fx.inspector.node_deleted_at(&id)?.is_some(), "operator delete ignored");
    Ok(())
}

fn nodes_tree_depth(fx: &Fixture) -> E2eResult<()> {
    let session = fx.harness.register(&unique_handle("tree"), PASSWORD)?;
    let root = fx.harness.ask_question(&session.token, "Tree root", &[])?;
    let a = fx.harness.answer_node(&session.token, &root, "Branch A", NodeType::Piece)?;
    fx.harness.answer_node(&session.token, &root, "Branch B", NodeType::Piece)?;
    let leaf = fx.harness.answer_node(&session.token, &a, "Leaf under A", NodeType::Piece)?;

    let shallow = fx.harness.get_tree(&root, 1)?;
    let children = shallow.require_array("children")?;
    ensure_that!(children.len() == 2, "depth 1 children: {}", children.len());
    ensure_that!(
        children.iter().all(|c| c.array_at("children").map_or(false, Vec::is_empty)),
        "depth 1 must not expand grandchildren"
    );

    let deep = fx.harness.get_tree(&root, 2)?;
    let branch_a = deep
        .require_array("children")?
        .iter()
        .find(|c| c.str_at("id") == Some(a.as_str()))
        .ok_or_else(|| E2eError::assertion("branch A missing from tree"))?;
    ensure_that!(
        contains_id(branch_a.require_array("children")?, &leaf),
        "leaf missing at depth 2"
    );
    Ok(())
}

fn nodes_clone_linkage(fx: &Fixture) -> E2eResult<()> {
    let author = fx.harness.register(&unique_handle("src"), PASSWORD)?;
    let cloner = fx.harness.register(&unique_handle("cln"), PASSWORD)?;
    let source = fx.harness.ask_question(&author.token, "A claim worth cloning", &["clone"])?;

    let clone = fx.harness.clone_node(&cloner.token, &source)?;
    ensure_that!(clone != source, "clone reused the source id");

    ensure_that!(
        fx.inspector.assert_clone_exists(&source)? == clone,
        "inspector found a different clone"
    );
    fx.inspector.assert_clone_linkage(&clone, &source)?;
    fx.inspector.assert_node_field(&clone, "author_id", &cloner.user_id)?;
    fx.inspector.assert_node_field(&clone, "depth", &0i64)?;

    let node = fx.harness.get_node(&clone)?;
    ensure_that!(node.str_at("clone_of") == Some(source.as_str()), "{}", node);
    Ok(())
}

// ============================================================================
// Visibility
// ============================================================================

fn visibility_strata_ladder(fx: &Fixture) -> E2eResult<()> {
    let strata = fx.inspector.strata()?;
    let names: Vec<&str> = strata.iter().map(|s| s.name.as_str()).collect();
    ensure_that!(
        names == ["public", "research", "provider", "instance"],
        "strata order: {:?}",
        names
    );
    for stratum in &strata {
        let visibility: Visibility = stratum.name.parse().map_err(E2eError::AssertionFailed)?;
        ensure_that!(
            stratum.min_role == visibility.min_role().as_str(),
            "stratum {} requires {}",
            stratum.name,
            stratum.min_role
        );
    }
    ensure_that!(
        fx.inspector.strata_visible_to(Role::Anon)? == ["public"],
        "anon sees more than public"
    );
    ensure_that!(
        fx.inspector.strata_visible_to(Role::Operator)?.len() == 4,
        "operator must see every stratum"
    );
    Ok(())
}

fn visibility_role_gates_reads(fx: &Fixture) -> E2eResult<()> {
    let author = fx.harness.register(&unique_handle("vis"), PASSWORD)?;
    let reader_handle = unique_handle("rdr");
    let reader = fx.harness.register(&reader_handle, PASSWORD)?;
    let id = fx.harness.ask_question(&author.token, "Research-only claim", &[])?;
    let path = format!("/api/node/{}", id);

    fx.inspector.set_node_visibility(&id, Visibility::Research)?;
    ensure_that!(fx.inspector.node_visibility(&id)? == Visibility::Research, "override lost");

    require_status(&fx.harness.get(&path, None)?, 404)?;
    require_status(&fx.harness.get(&path, Some(reader.token.as_str()))?, 404)?;
    ensure_that!(
        !contains_id(&fx.harness.list_questions(Some(reader.token.as_str()))?, &id),
        "research node listed for a plain user"
    );

    fx.inspector.set_user_role(&reader_handle, Role::Researcher)?;
    require_status(&fx.harness.get(&path, Some(reader.token.as_str()))?, 200)?;
    ensure_that!(
        contains_id(&fx.harness.list_questions(Some(reader.token.as_str()))?, &id),
        "research node hidden from a researcher"
    );

    fx.inspector.set_node_visibility(&id, Visibility::Public)?;
    require_status(&fx.harness.get(&path, None)?, 200)
}

// ============================================================================
// Flows
// ============================================================================

fn flows_ask_records_steps(fx: &Fixture) -> E2eResult<()> {
    let session = fx.harness.register(&unique_handle("flow"), PASSWORD)?;
    let (resp, created): (_, Value) = fx.harness.json(
        Method::POST,
        "/api/ask",
        Some(&json!({ "body": "Which steps does an ask record?" })),
        Some(session.token.as_str()),
    )?;
    require_status(&resp, 201)?;
    let node_id = created.require_str("id")?;
    let flow_id = created.require_str("flow_id")?;

    let steps = fx.inspector.query_flow_steps(flow_id)?;
    let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    ensure_that!(names == ["received", "validated", "stored"], "steps: {:?}", names);
    ensure_that!(
        steps.windows(2).all(|w| w[0].seq < w[1].seq),
        "steps out of order"
    );
    ensure_that!(
        fx.inspector.latest_flow_for_node(node_id)?.as_deref() == Some(flow_id),
        "latest flow mismatch"
    );
    let flows = fx
        .inspector
        .flows_scalar_int("SELECT COUNT(*) FROM flows WHERE node_id = ?1", &[&node_id])?;
    ensure_that!(flows == 1, "{} flows for one ask", flows);
    Ok(())
}

// ============================================================================
// Bot
// ============================================================================

fn bot_answer_with_llm(fx: &Fixture) -> E2eResult<()> {
    fx.harness.skip_unless_llm()?;

    let session = fx.harness.register(&unique_handle("bot"), PASSWORD)?;
    let id = fx.harness.ask_question(&session.token, "Bot, what do you think?", &[])?;
    let resp = fx
        .harness
        .request(Method::POST, &format!("/api/bot/answer/{}", id), None, Some(session.token.as_str()))?;
    require_status(&resp, 202)?;
    ensure_that!(resp.value()?.bool_at("queued") == Some(true), "not queued");
    Ok(())
}

fn bot_answer_without_llm(fx: &Fixture) -> E2eResult<()> {
    if fx.harness.has_llm() {
        return Err(E2eError::skipped("an LLM provider is configured"));
    }

    let session = fx.harness.register(&unique_handle("nobot"), PASSWORD)?;
    let id = fx.harness.ask_question(&session.token, "Nobody can answer this", &[])?;
    let resp = fx
        .harness
        .request(Method::POST, &format!("/api/bot/answer/{}", id), None, Some(session.token.as_str()))?;
    require_status(&resp, 503)?;
    resp.value()?.require_str("error")?;
    Ok(())
}
