use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sbot_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("sbot");
    path
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct TestEnv {
    _tmp: TempDir,
    root: PathBuf,
    config_path: PathBuf,
    bind: String,
}

/// A temp root with a config, an empty database path and scraped fixture
/// files for all three sources. `llm_url` points the Anthropic client at a
/// mock server.
fn setup_test_env(llm_url: Option<&str>) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let data_dir = root.join("data");
    fs::create_dir_all(data_dir.join("website")).unwrap();
    fs::create_dir_all(data_dir.join("blog")).unwrap();
    fs::create_dir_all(root.join("config")).unwrap();

    fs::write(
        data_dir.join("gitbook_data.json"),
        json!([
            {
                "title": "What are Autopools?",
                "url": "https://docs.auto.finance/autopools",
                "content": "Autopools are automated liquidity vaults that rebalance across DEXs and lending markets.",
                "source": "gitbook"
            },
            {
                "title": "TOKE staking",
                "url": "https://docs.auto.finance/toke",
                "content": "Staking TOKE earns a share of protocol fees and governance rights.",
                "source": "gitbook"
            }
        ])
        .to_string(),
    )
    .unwrap();
    fs::write(
        data_dir.join("website").join("website_data.json"),
        json!([
            {
                "title": "autoETH",
                "url": "https://app.auto.finance/pools/autoETH",
                "content": "autoETH is one of the Autopools. APY 7.2%. TVL $12,400,000.",
                "source": "website",
                "metadata": {"has_live_data": true}
            }
        ])
        .to_string(),
    )
    .unwrap();
    fs::write(
        data_dir.join("blog").join("blog_posts.json"),
        json!([
            {
                "title": "Introducing Autopools",
                "url": "https://blog.tokemak.xyz/autopools",
                "content": "Today we launch Autopools, the next chapter of liquidity routing.",
                "source": "blog"
            }
        ])
        .to_string(),
    )
    .unwrap();

    let bind = format!("127.0.0.1:{}", free_port());
    let llm = llm_url
        .map(|url| format!("anthropic_url = \"{}\"\n", url))
        .unwrap_or_default();
    let config_content = format!(
        r#"[db]
path = "{root}/data/bot.sqlite"

[llm]
model = "claude-sonnet-4-20250514"
max_retries = 0
{llm}
[bot]
project_name = "Auto Finance"

[scraper]
output_dir = "{root}/data"

[server]
bind = "{bind}"
"#,
        root = root.display(),
        llm = llm,
        bind = bind,
    );

    let config_path = root.join("config").join("support.toml");
    fs::write(&config_path, config_content).unwrap();

    TestEnv {
        _tmp: tmp,
        root,
        config_path,
        bind,
    }
}

fn sbot_command(env: &TestEnv, args: &[&str]) -> Command {
    let mut cmd = Command::new(sbot_binary());
    cmd.current_dir(&env.root)
        .arg("--config")
        .arg(&env.config_path)
        .args(args)
        .env("ANTHROPIC_API_KEY", "test-key")
        .env("RUST_LOG", "warn")
        .env_remove("BOT_MODEL")
        .env_remove("BOT_MAX_TOKENS")
        .env_remove("GOOGLE_CLIENT_ID");
    cmd
}

fn run_sbot(env: &TestEnv, args: &[&str]) -> (String, String, bool) {
    let output = sbot_command(env, args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run sbot binary at {:?}: {}", sbot_binary(), e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn config_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

/// Mock Anthropic endpoint answering every request with `answer`.
fn mock_llm(rt: &tokio::runtime::Runtime, answer: &str) -> MockServer {
    let server = rt.block_on(MockServer::start());
    rt.block_on(
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "model": "claude-sonnet-4-20250514",
                "content": [{"type": "text", "text": answer}],
                "usage": {"input_tokens": 120, "output_tokens": 30}
            })))
            .mount(&server),
    );
    server
}

/// Kills the server process when the test ends, pass or fail.
struct ServerGuard(Child);

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn start_server(env: &TestEnv, extra: &[&str]) -> ServerGuard {
    let mut args = vec!["serve"];
    args.extend_from_slice(extra);
    let child = sbot_command(env, &args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn sbot serve");
    let guard = ServerGuard(child);

    let client = reqwest::blocking::Client::new();
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if let Ok(resp) = client.get(format!("http://{}/api/health", env.bind)).send() {
            if resp.status().is_success() {
                return guard;
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    panic!("server did not become healthy on {}", env.bind);
}

#[test]
fn test_init_creates_database() {
    let env = setup_test_env(None);

    let (stdout, stderr, success) = run_sbot(&env, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(env.root.join("data/bot.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let env = setup_test_env(None);

    let (_, _, success1) = run_sbot(&env, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_sbot(&env, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_missing_config_fails() {
    let output = Command::new(sbot_binary())
        .arg("--config")
        .arg("/nonexistent/support.toml")
        .arg("init")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to read config file"));
}

#[test]
fn test_index_build_and_search() {
    let env = setup_test_env(None);
    run_sbot(&env, &["init"]);

    let (stdout, stderr, success) = run_sbot(&env, &["index", "build"]);
    assert!(success, "index build failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Indexed"));
    assert!(stdout.contains("website 1"));

    let (stdout, _, success) = run_sbot(&env, &["search", "Autopools"]);
    assert!(success);
    // Live website data ranks ahead of documentation and blog.
    let first = stdout.lines().next().unwrap_or_default();
    assert!(first.contains("website"), "unexpected ranking:\n{}", stdout);
    assert!(stdout.contains("docs.auto.finance/autopools"));

    let (stdout, _, success) = run_sbot(&env, &["index", "verify"]);
    assert!(success);
    assert!(stdout.contains("holds"));
}

#[test]
fn test_search_before_index_has_no_results() {
    let env = setup_test_env(None);
    run_sbot(&env, &["init"]);

    let (stdout, _, success) = run_sbot(&env, &["search", "Autopools"]);
    assert!(success);
    assert!(stdout.contains("No results"));
}

#[test]
fn test_ask_answers_from_mocked_llm() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = mock_llm(&rt, "Autopools are automated liquidity vaults.");
    let env = setup_test_env(Some(&server.uri()));
    run_sbot(&env, &["init"]);
    run_sbot(&env, &["index", "build"]);

    let (stdout, stderr, success) =
        run_sbot(&env, &["ask", "What are Autopools?", "--show-context"]);
    assert!(success, "ask failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Autopools are automated liquidity vaults."));
    assert!(stdout.contains("[Source 1 - Website (Live Data)]"));
    assert!(stdout.contains("tokens: 120 in / 30 out"));

    let requests = rt.block_on(server.received_requests()).unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(body["system"].as_str().unwrap().contains("Auto Finance"));
}

#[test]
fn test_ask_without_index_fails() {
    let env = setup_test_env(None);
    run_sbot(&env, &["init"]);

    let (_, stderr, success) = run_sbot(&env, &["ask", "What are Autopools?"]);
    assert!(!success);
    assert!(stderr.contains("Index not built"));
}

#[test]
fn test_bots_add_list_remove() {
    let env = setup_test_env(None);
    run_sbot(&env, &["init"]);

    let (stdout, stderr, success) = run_sbot(
        &env,
        &[
            "bots", "add", "--platform", "telegram", "--name", "Support", "--token",
            "123:secret-token", "--bot-id", "tg_main",
        ],
    );
    assert!(success, "bots add failed: stdout={}, stderr={}", stdout, stderr);

    let (_, _, success) = run_sbot(
        &env,
        &[
            "bots", "add", "--platform", "telegram", "--name", "Again", "--token", "1:x",
            "--bot-id", "tg_main",
        ],
    );
    assert!(!success, "duplicate bot id must be rejected");

    let (_, stderr, success) = run_sbot(
        &env,
        &["bots", "add", "--platform", "slack", "--name", "S", "--token", "xoxb-only"],
    );
    assert!(!success);
    assert!(stderr.contains("xapp-"));

    let (stdout, _, success) = run_sbot(&env, &["bots", "list"]);
    assert!(success);
    assert!(stdout.contains("tg_main"));
    assert!(stdout.contains("registered"));
    assert!(stdout.contains("gpt-4o"));
    assert!(!stdout.contains("secret-token"));

    let (_, _, success) = run_sbot(&env, &["bots", "remove", "tg_main"]);
    assert!(success);
    let (_, _, success) = run_sbot(&env, &["bots", "remove", "tg_main"]);
    assert!(!success);
}

#[test]
fn test_conversation_reports_on_empty_database() {
    let env = setup_test_env(None);
    run_sbot(&env, &["init"]);

    let (stdout, _, success) = run_sbot(&env, &["conversations", "analytics"]);
    assert!(success);
    assert!(stdout.contains("Total conversations: 0"));

    let (stdout, _, success) = run_sbot(&env, &["conversations", "users"]);
    assert!(success);
    assert!(stdout.contains("No users yet"));

    let out = env.root.join("exports/conversations.json");
    let (_, stderr, success) = run_sbot(
        &env,
        &["conversations", "export", "--output", config_str(&out)],
    );
    assert!(success, "export failed: {}", stderr);
    let exported: Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(exported, json!([]));

    let (stdout, _, success) = run_sbot(&env, &["stats"]);
    assert!(success);
    assert!(stdout.contains("No collections"));
}

#[test]
fn test_server_health_ask_and_bot_registry() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let server = mock_llm(&rt, "autoETH currently pays 7.2% APY.");
    let env = setup_test_env(Some(&server.uri()));
    run_sbot(&env, &["init"]);
    run_sbot(&env, &["index", "build"]);

    let _guard = start_server(&env, &["--no-scheduler"]);
    let base = format!("http://{}", env.bind);
    let client = reqwest::blocking::Client::new();

    let health: Value = client
        .get(format!("{}/api/health", base))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["rag_agent"], "claude");

    let root: Value = client.get(&base).send().unwrap().json().unwrap();
    assert_eq!(root["service"], "Auto Finance Bot API");

    let answer: Value = client
        .post(format!("{}/api/ask", base))
        .json(&json!({
            "question": "What APY does autoETH pay?",
            "user_id": "google-42",
            "user_name": "Ada",
            "thread_id": "thread-1"
        }))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(answer["answer"], "autoETH currently pays 7.2% APY.");
    assert_eq!(answer["thread_id"], "thread-1");
    assert!(!answer["timestamp"].as_str().unwrap().is_empty());

    let stats: Value = client
        .get(format!("{}/api/stats", base))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(stats["total_conversations"], 1);
    assert_eq!(stats["total_tokens"], 150);

    let messages: Value = client
        .get(format!("{}/api/threads/thread-1/messages", base))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(messages[0]["question"], "What APY does autoETH pay?");

    let bots: Value = client
        .get(format!("{}/api/bots", base))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(bots["bots"], json!([]));

    let registered: Value = client
        .post(format!("{}/api/bots/register", base))
        .json(&json!({"platform": "telegram", "token": "1:abc", "name": "Support"}))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(registered["success"], true);
    assert_eq!(registered["bot"]["status"], "stopped");
    assert!(registered["bot"].get("token").is_none());
    let bot_id = registered["bot"]["bot_id"].as_str().unwrap().to_string();

    let updated: Value = client
        .put(format!("{}/api/bots/{}", base, bot_id))
        .json(&json!({"model": "claude-sonnet-4-20250514"}))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(updated["bot"]["model"], "claude-sonnet-4-20250514");

    let logs: Value = client
        .get(format!("{}/api/bots/{}/logs?limit=5", base, bot_id))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert!(logs["logs"].as_array().unwrap().len() >= 2);

    let stop = client
        .post(format!("{}/api/bots/{}/stop", base, bot_id))
        .send()
        .unwrap();
    assert_eq!(stop.status().as_u16(), 409);

    let bad = client
        .post(format!("{}/api/bots/register", base))
        .json(&json!({"platform": "irc", "token": "x", "name": "Nope"}))
        .send()
        .unwrap();
    assert_eq!(bad.status().as_u16(), 400);

    let deleted = client
        .delete(format!("{}/api/bots/{}", base, bot_id))
        .send()
        .unwrap();
    assert!(deleted.status().is_success());
    let missing = client
        .get(format!("{}/api/bots/{}", base, bot_id))
        .send()
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);

    let scraper = client
        .get(format!("{}/api/scraper/status", base))
        .send()
        .unwrap();
    assert_eq!(scraper.status().as_u16(), 404);
}

#[test]
fn test_google_auth_rejects_without_client_id() {
    let env = setup_test_env(None);
    run_sbot(&env, &["init"]);
    let _guard = start_server(&env, &["--no-scheduler", "--no-bots"]);
    let client = reqwest::blocking::Client::new();

    let config: Value = client
        .get(format!("http://{}/api/config", env.bind))
        .send()
        .unwrap()
        .json()
        .unwrap();
    assert_eq!(config["google_client_id"], Value::Null);

    let resp = client
        .post(format!("http://{}/api/auth/google", env.bind))
        .json(&json!({"id_token": "not-a-token"}))
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let body: Value = resp.json().unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");
}
