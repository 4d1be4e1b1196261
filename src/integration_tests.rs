//! End-to-end scenarios through the full pipeline: scripted engines and
//! prompter, real filesystem and git in a temp workspace.

use std::path::PathBuf;

use serde_json::json;

use crate::config::AppConfig;
use crate::executor::git;
use crate::extractor::{self, ContentKind};
use crate::lifecycle::Role;
use crate::orchestrator::Orchestrator;
use crate::permission::{Category, Decision};
use crate::testing::{test_models_config, ScriptedLoader, ScriptedPrompter};

struct Harness {
    orchestrator: Orchestrator,
    prompter: ScriptedPrompter,
    loads: std::sync::Arc<std::sync::Mutex<Vec<PathBuf>>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(responses: Vec<&str>, decisions: Vec<Decision>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.models = test_models_config(dir.path());
        config.workspace_dir = dir.path().join("ws").display().to_string();

        let loader =
            ScriptedLoader::with_responses(responses.iter().map(|s| s.to_string()).collect());
        let loads = loader.loads.clone();
        let prompter = ScriptedPrompter::new(decisions);
        let handle = prompter.clone();

        let orchestrator =
            Orchestrator::new(config, Box::new(loader), Box::new(prompter)).unwrap();
        Self {
            orchestrator,
            prompter: handle,
            loads,
            _dir: dir,
        }
    }

    fn workspace(&self) -> PathBuf {
        self.orchestrator.workspace().clone()
    }

    fn load_count(&self) -> usize {
        self.loads.lock().unwrap().len()
    }

    async fn init_git(&self) {
        let ws = self.workspace();
        git::execute(&ws, "init", &json!({})).await.unwrap();
        // Identity so commits work in a bare CI environment.
        for (key, value) in [("user.email", "dev@example.com"), ("user.name", "Dev")] {
            tokio::process::Command::new("git")
                .args(["config", key, value])
                .current_dir(&ws)
                .output()
                .await
                .unwrap();
        }
    }
}

/// The router reply every test uses when it wants tier B to fire.
const JUNK: &str = "no json here";

#[tokio::test]
async fn git_status_on_clean_workspace() {
    let harness = Harness::new(vec![JUNK], vec![]);
    harness.init_git().await;

    let outcome = harness.orchestrator.process("git status").await;
    assert_eq!(outcome.text, "Working directory is clean");
    assert!(!outcome.denied);
    assert_eq!(harness.prompter.asked(), 0, "reads never prompt");
    assert_eq!(harness.load_count(), 1, "no model load beyond the router");
}

#[tokio::test]
async fn create_file_flow_writes_after_approval() {
    let coder_reply =
        "```python\ndef add(a, b):\n    return a + b\n\ndef sub(a, b):\n    return a - b\n```";
    let harness = Harness::new(vec![JUNK, coder_reply], vec![Decision::AllowOnce]);

    let outcome = harness
        .orchestrator
        .process("create calc.py with add and sub functions")
        .await;

    assert!(!outcome.denied, "{}", outcome.text);
    let written = std::fs::read_to_string(harness.workspace().join("calc.py")).unwrap();
    assert!(written.contains("def add("));
    assert!(written.contains("def sub("));
    assert_eq!(harness.prompter.asked(), 1);
    assert!(!harness.workspace().join("calc.py.part").exists());
}

#[tokio::test]
async fn denied_write_leaves_no_file_and_sets_denied() {
    let coder_reply = "```python\ndef add(a, b):\n    return a + b\n```";
    let harness = Harness::new(vec![JUNK, coder_reply], vec![Decision::Deny]);

    let outcome = harness
        .orchestrator
        .process("create calc.py with add and sub functions")
        .await;

    assert!(outcome.denied);
    assert!(!harness.workspace().join("calc.py").exists());
    assert!(
        !harness.workspace().join("calc.py.part").exists(),
        "denied write cleans up its .part file"
    );
}

#[tokio::test]
async fn algorithm_escalation_unloads_the_coder() {
    let coder_reply = "```python\ndef add(a, b):\n    return a + b\n```";
    let algorithm_reply = "```python\ndef binary_search(items, target):\n    lo, hi = 0, len(items)\n    while lo < hi:\n        mid = (lo + hi) // 2\n        if items[mid] < target:\n            lo = mid + 1\n        else:\n            hi = mid\n    return lo\n```\nTime complexity: O(log n)\nSpace complexity: O(1)\nHalving the range each probe.";
    let harness = Harness::new(
        vec![JUNK, coder_reply, JUNK, algorithm_reply],
        vec![Decision::AllowOnce],
    );

    // Load the coder with a first task.
    harness
        .orchestrator
        .process("create calc.py with add and sub functions")
        .await;
    assert!(harness.orchestrator.lifecycle().is_loaded(Role::Coder).await);

    // Coder (4800) + algorithm (4500) cannot be co-resident in 6000.
    let outcome = harness
        .orchestrator
        .process("implement binary search with O(log n) complexity")
        .await;

    assert!(outcome.text.contains("O(log n)"), "{}", outcome.text);
    let lifecycle = harness.orchestrator.lifecycle();
    assert!(!lifecycle.is_loaded(Role::Coder).await);
    assert!(lifecycle.is_loaded(Role::Algorithm).await);
}

#[tokio::test]
async fn sequential_plan_skips_after_failure() {
    let coder_reply = "```python\nprint('hello')\n```";
    let harness = Harness::new(
        vec![coder_reply],
        vec![Decision::AllowOnce, Decision::AllowOnce],
    );
    harness.init_git().await;

    let outcome = harness
        .orchestrator
        .process("create test.py then run it then commit")
        .await;

    assert!(harness.workspace().join("test.py").exists());
    // "run it" resolves to a command that does not exist, failing step 2;
    // the commit step is skipped, never executed.
    assert!(
        outcome.text.contains("1 completed, 1 failed, 1 skipped"),
        "{}",
        outcome.text
    );

    let log = git::execute(&harness.workspace(), "log", &json!({})).await;
    assert!(log.is_err(), "nothing was committed");
}

#[tokio::test]
async fn edit_flow_applies_validated_blocks() {
    let existing: String = (1..=20)
        .map(|i| format!("def f{}(a):\n    return a\n", i))
        .collect();
    let edit_reply = "EDIT 1:\nLines: 1-1\nDescription: Add type hints\nOld:\n```\ndef f1(a):\n```\nNew:\n```\ndef f1(a: int) -> int:\n```";
    let harness = Harness::new(vec![JUNK, edit_reply], vec![Decision::AllowOnce]);
    std::fs::write(harness.workspace().join("calc.py"), &existing).unwrap();

    let outcome = harness
        .orchestrator
        .process("edit calc.py to add type hints")
        .await;

    assert!(!outcome.denied, "{}", outcome.text);
    let updated = std::fs::read_to_string(harness.workspace().join("calc.py")).unwrap();
    assert!(updated.contains("def f1(a: int) -> int:"));
    assert_eq!(updated.lines().count(), existing.lines().count());
    // Untouched lines stay byte-identical.
    assert!(updated.contains("def f2(a):"));
    assert!(outcome.text.contains("Diff mode saved"), "{}", outcome.text);
}

#[tokio::test]
async fn edit_flow_retries_once_on_invalid_blocks() {
    let existing = "line one\nline two\n";
    let bad_reply =
        "EDIT 1:\nLines: 90-95\nDescription: out of range\nOld:\n```\nx\n```\nNew:\n```\ny\n```";
    let good_reply =
        "EDIT 1:\nLines: 2-2\nDescription: fix\nOld:\n```\nline two\n```\nNew:\n```\nline 2\n```";
    let harness = Harness::new(vec![JUNK, bad_reply, good_reply], vec![Decision::AllowOnce]);
    std::fs::write(harness.workspace().join("notes.txt"), existing).unwrap();

    let outcome = harness
        .orchestrator
        .process("edit notes.txt to tidy the second line")
        .await;

    assert!(!outcome.failed, "{}", outcome.text);
    let updated = std::fs::read_to_string(harness.workspace().join("notes.txt")).unwrap();
    assert!(updated.contains("line 2"));
}

#[tokio::test]
async fn fullstack_plan_produces_every_file() {
    let replies = vec![
        "```python\nimport sqlite3\n\nSCHEMA = \"CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT, done INTEGER)\"\n```",
        "```python\nfrom flask import Flask, jsonify\n\napp = Flask(__name__)\n\n@app.route('/api/todos')\ndef todos():\n    return jsonify([])\n```",
        "```python\nimport sqlite3\nfrom models import SCHEMA\n\nconn = sqlite3.connect('app.db')\nconn.execute(SCHEMA)\nconn.commit()\n```",
        "```html\n<!DOCTYPE html>\n<html>\n<head><title>Todos</title></head>\n<body><ul id=\"todos\"></ul></body>\n</html>\n```",
        "```css\nbody { font-family: sans-serif; margin: 2rem; }\n#todos { list-style: none; }\n```",
        "```javascript\nconst list = document.getElementById('todos');\nfetch('/api/todos').then(r => r.json()).then(render);\nfunction render(items) { list.innerHTML = ''; }\n```",
        "```markdown\n# Todo App\n\nFlask + SQLite todo list.\n\n## Setup\n\nRun `python init_db.py` then `python app.py`.\n```",
    ];
    let harness = Harness::new(replies, vec![Decision::AllowBatch, Decision::AllowOnce]);

    let outcome = harness
        .orchestrator
        .process("create a full-stack todo app with Flask backend and SQLite database")
        .await;

    assert!(outcome.text.contains("Plan: 8 step(s)"), "{}", outcome.text);
    assert!(
        outcome.text.contains("8 completed, 0 failed, 0 skipped"),
        "{}",
        outcome.text
    );

    let ws = harness.workspace();
    let expectations = [
        ("models.py", ContentKind::Py),
        ("app.py", ContentKind::Py),
        ("init_db.py", ContentKind::Py),
        ("templates/index.html", ContentKind::Html),
        ("static/css/style.css", ContentKind::Css),
        ("static/js/app.js", ContentKind::Js),
        ("README.md", ContentKind::Md),
    ];
    for (file, kind) in expectations {
        let path = ws.join(file);
        assert!(path.exists(), "missing {}", file);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.trim().is_empty(), "{} is empty", file);
        assert!(
            extractor::validate(&content, kind),
            "{} fails its type heuristic",
            file
        );
    }

    // One folded prompt covering the write batch, one for mkdir.
    assert_eq!(harness.prompter.asked(), 2);
    let mkdir_request = harness
        .prompter
        .requests()
        .into_iter()
        .find(|r| r.category == Category::DirectoryCreate)
        .expect("mkdir prompt recorded");
    assert!(mkdir_request
        .preview
        .as_deref()
        .unwrap()
        .contains("static/css"));
}

#[tokio::test]
async fn raw_mkdir_command_folds_into_one_prompt() {
    let harness = Harness::new(vec![JUNK], vec![Decision::AllowOnce]);

    let outcome = harness
        .orchestrator
        .process("mkdir -p templates static/css static/js")
        .await;

    assert!(!outcome.failed, "{}", outcome.text);
    assert!(harness.workspace().join("static/js").is_dir());
    assert_eq!(harness.prompter.asked(), 1, "one folded prompt for three dirs");
    let request = &harness.prompter.requests()[0];
    assert_eq!(request.category, Category::DirectoryCreate);
    assert!(request.description.contains("3 directories"));
}

#[tokio::test]
async fn low_confidence_input_asks_for_clarification() {
    let harness = Harness::new(vec![JUNK], vec![]);
    let outcome = harness
        .orchestrator
        .process("hmm quite puzzling indeed")
        .await;
    assert!(outcome.text.contains("Did you want to"), "{}", outcome.text);
    assert!(!outcome.failed);
}

#[tokio::test]
async fn forbidden_shell_command_never_prompts() {
    let harness = Harness::new(vec![JUNK], vec![]);
    let outcome = harness.orchestrator.process("run rm -rf /").await;
    assert!(outcome.failed);
    assert!(outcome.text.contains("forbidden"), "{}", outcome.text);
    assert_eq!(harness.prompter.asked(), 0);
}

#[tokio::test]
async fn coder_specialist_marker_reroutes_to_algorithm() {
    let algorithm_reply =
        "```python\ndef solve():\n    pass\n```\nTime complexity: O(n)\nSpace complexity: O(1)\nSingle pass.";
    let harness = Harness::new(
        vec![JUNK, "NEEDS_ALGORITHM_SPECIALIST", algorithm_reply],
        vec![Decision::AllowOnce],
    );

    let outcome = harness
        .orchestrator
        .process("create solver.py that schedules overlapping jobs")
        .await;

    assert!(outcome.text.contains("O(n)"), "{}", outcome.text);
    assert!(harness
        .orchestrator
        .lifecycle()
        .is_loaded(Role::Algorithm)
        .await);
}
