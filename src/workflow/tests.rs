use super::*;
use crate::confirm::ScriptedSurface;
use crate::generate::{GenerationRequest, ImplementationSuggestion, OpenRouterGenerator, StaticGenerator};
use crate::runtime::Runtime;
use crate::script::{OutputSink, Value};
use std::fs;
use std::net::TcpListener;
use std::time::Duration;

fn runtime_with(
    generator: Option<Arc<dyn ImplementationGenerator>>,
    surface: Arc<ScriptedSurface>,
    settings: Settings,
) -> Runtime {
    let mut orchestrator = Orchestrator::new(surface, settings);
    if let Some(generator) = generator {
        orchestrator = orchestrator.with_generator(generator);
    }
    Runtime::new(Arc::new(orchestrator), OutputSink::buffer())
}

fn script_error_kind(result: Result<Value>) -> String {
    match result {
        Err(PatchError::Script { kind, .. }) => kind,
        other => panic!("expected a script error, got {:?}", other),
    }
}

/// Records what each request carried, then answers like a [`StaticGenerator`].
struct RecordingGenerator {
    inner: StaticGenerator,
    chains: Mutex<Vec<Vec<String>>>,
    descriptions: Mutex<Vec<String>>,
}

impl RecordingGenerator {
    fn new(inner: StaticGenerator) -> Self {
        Self {
            inner,
            chains: Mutex::new(Vec::new()),
            descriptions: Mutex::new(Vec::new()),
        }
    }
}

impl ImplementationGenerator for RecordingGenerator {
    fn suggest(&self, request: &GenerationRequest) -> Result<ImplementationSuggestion> {
        lock(&self.chains).push(request.chain.iter().map(|f| f.descriptor.qualname.clone()).collect());
        lock(&self.descriptions).push(request.description.clone());
        self.inner.suggest(request)
    }
}

const ADDER: &str = "\
def add(a, b):
    raise NotImplementedError

plus = add

def total(x, y):
    return add(x, y) + 1
";

#[test]
fn test_ephemeral_patch_resumes_caller_and_reaches_aliases() {
    let generator = Arc::new(StaticGenerator::new().with("add", "def add(a, b):\n    return a * b\n"));
    let surface = Arc::new(ScriptedSurface::new());
    let mut rt = runtime_with(Some(generator.clone()), surface.clone(), Settings::default());
    let module = rt.load_source("adder", ADDER).unwrap();

    let total = module.get("total").unwrap();
    assert_eq!(rt.call_guarded(&total, vec![Value::Int(3), Value::Int(4)]).unwrap().as_int(), Some(13));

    // The alias was bound before the patch and still sees the new body.
    let plus = module.get("plus").unwrap();
    assert_eq!(rt.call(&plus, vec![Value::Int(3), Value::Int(4)]).unwrap().as_int(), Some(12));

    let history = rt.history();
    assert_eq!(history.len(), 1);
    let report = &history[0];
    assert_eq!(report.target, "add");
    assert_eq!(report.depth, 1);
    assert_eq!(
        report.transitions,
        vec![
            WorkflowState::Detected,
            WorkflowState::ChainCaptured,
            WorkflowState::Requesting,
            WorkflowState::Suggested,
            WorkflowState::Confirmed,
            WorkflowState::Validating,
            WorkflowState::Applied,
            WorkflowState::Resumed,
        ]
    );
    assert_eq!(
        report.outcome,
        PatchOutcome::Applied {
            durability: Durability::Ephemeral,
            replayed: true
        }
    );
    assert!(report.finished_at.is_some());
    assert_eq!(generator.requests(), vec!["add".to_string()]);
}

#[test]
fn test_decline_propagates_original_failure() {
    let surface = Arc::new(ScriptedSurface::declining());
    let generator = Arc::new(StaticGenerator::new().with("add", "def add(a, b):\n    return a * b\n"));
    let mut rt = runtime_with(Some(generator.clone()), surface.clone(), Settings::default());
    let module = rt.load_source("adder", ADDER).unwrap();

    let total = module.get("total").unwrap();
    let kind = script_error_kind(rt.call_guarded(&total, vec![Value::Int(1), Value::Int(2)]));
    assert_eq!(kind, "NotImplementedError");

    let report = &rt.history()[0];
    assert_eq!(report.outcome, PatchOutcome::Declined);
    assert_eq!(report.final_state(), Some(WorkflowState::Propagated));
    assert!(report.reached(WorkflowState::Declined));
    assert_eq!(report.error.as_deref(), Some("user declined to provide an implementation"));
    assert!(generator.requests().is_empty());
    assert_eq!(surface.events(), vec!["generate?:add", "author:add"]);
    assert_eq!(module.function("add").unwrap().revision(), 0);
}

#[test]
fn test_recursive_reentrancy_nests_a_complete_workflow() {
    let src = "\
def a(x):
    raise NotImplementedError

def b(x):
    raise NotImplementedError

def main():
    return a(2)
";
    let generator = Arc::new(RecordingGenerator::new(
        StaticGenerator::new()
            .with("a", "def a(x):\n    return b(x) + 1\n")
            .with("b", "def b(x):\n    return x * 10\n"),
    ));
    let surface = Arc::new(ScriptedSurface::new());
    let mut rt = runtime_with(Some(generator.clone()), surface, Settings::default());
    let module = rt.load_source("nested", src).unwrap();

    let main = module.get("main").unwrap();
    assert_eq!(rt.call_guarded(&main, vec![]).unwrap().as_int(), Some(21));

    let history = rt.history();
    let targets: Vec<&str> = history.iter().map(|r| r.target.as_str()).collect();
    assert_eq!(targets, vec!["b", "a"]);
    let (inner, outer) = (&history[0], &history[1]);
    assert_eq!(inner.depth, 2);
    assert_eq!(outer.depth, 1);
    assert_eq!(inner.final_state(), Some(WorkflowState::Resumed));
    assert_eq!(outer.final_state(), Some(WorkflowState::Resumed));

    // a's replay runs after APPLIED; b opens and closes inside it, before a resumes.
    let applied = outer.tick_of(WorkflowState::Applied).unwrap();
    let resumed = outer.tick_of(WorkflowState::Resumed).unwrap();
    assert!(applied < resumed);
    assert!(applied < inner.tick_of(WorkflowState::Detected).unwrap());
    assert!(inner.finished_tick.unwrap() < resumed);
    assert!(inner.finished_at <= outer.finished_at);

    // b was reached through a's replayed body.
    let chains = lock(&generator.chains).clone();
    assert_eq!(chains[0], vec!["main".to_string(), "a".to_string()]);
    assert_eq!(chains[1], vec!["main".to_string(), "a".to_string(), "b".to_string()]);
}

#[test]
fn test_shared_exception_instance_is_detected_at_each_raise() {
    let src = "\
TODO = NotImplementedError('later')

def f(x):
    raise TODO

def g(x):
    raise TODO

def main():
    return f(1) + g(2)
";
    let generator = Arc::new(RecordingGenerator::new(
        StaticGenerator::new()
            .with("f", "def f(x):\n    return x + 1\n")
            .with("g", "def g(x):\n    return x * 10\n"),
    ));
    let mut rt = runtime_with(Some(generator.clone()), Arc::new(ScriptedSurface::new()), Settings::default());
    let module = rt.load_source("shared", src).unwrap();

    let main = module.get("main").unwrap();
    assert_eq!(rt.call_guarded(&main, vec![]).unwrap().as_int(), Some(22));

    let targets: Vec<String> = rt.history().iter().map(|r| r.target.clone()).collect();
    assert_eq!(targets, vec!["f", "g"]);
    let chains = lock(&generator.chains).clone();
    assert_eq!(chains[1], vec!["main".to_string(), "g".to_string()]);
}

#[test]
fn test_invalid_candidate_returns_to_editing() {
    let generator = Arc::new(StaticGenerator::new().with("add", "def add(a):\n    return a\n"));
    let surface = Arc::new(ScriptedSurface::new().then_author(Some("def add(x, y):\n    return x - y\n")));
    let mut rt = runtime_with(Some(generator), surface.clone(), Settings::default());
    let module = rt.load_source("adder", ADDER).unwrap();

    let total = module.get("total").unwrap();
    assert_eq!(rt.call_guarded(&total, vec![Value::Int(3), Value::Int(4)]).unwrap().as_int(), Some(0));

    let report = &rt.history()[0];
    assert_eq!(
        &report.transitions[3..],
        &[
            WorkflowState::Suggested,
            WorkflowState::Confirmed,
            WorkflowState::Validating,
            WorkflowState::ValidationFailed,
            WorkflowState::Edited,
            WorkflowState::Validating,
            WorkflowState::Applied,
            WorkflowState::Resumed,
        ]
    );
    assert_eq!(surface.events(), vec!["generate?:add", "review:add", "author:add"]);
}

#[test]
fn test_repeated_mismatch_is_rejected() {
    let surface = Arc::new(
        ScriptedSurface::new()
            .then_author(Some("def add(a):\n    return a\n"))
            .then_author(Some("def add(a, b, c):\n    return a\n")),
    );
    let settings = Settings {
        max_attempts: 1,
        ..Settings::default()
    };
    let mut rt = runtime_with(None, surface.clone(), settings);
    let module = rt.load_source("adder", ADDER).unwrap();

    let total = module.get("total").unwrap();
    assert_eq!(
        script_error_kind(rt.call_guarded(&total, vec![Value::Int(3), Value::Int(4)])),
        "NotImplementedError"
    );
    let report = &rt.history()[0];
    assert_eq!(report.outcome, PatchOutcome::Rejected { original: 2, candidate: 3 });
    assert_eq!(report.final_state(), Some(WorkflowState::Propagated));
    assert!(surface.notices().iter().any(|n| n.contains("Giving up on add")));
    assert_eq!(module.function("add").unwrap().revision(), 0);
}

#[test]
fn test_rejected_suggestion_falls_back_to_manual() {
    let generator = Arc::new(StaticGenerator::new().with("add", "def add(a, b):\n    return a * b\n"));
    let surface = Arc::new(
        ScriptedSurface::new()
            .then_review(Review::Reject)
            .then_author(Some("def add(a, b):\n    return a + b\n")),
    );
    let mut rt = runtime_with(Some(generator), surface, Settings::default());
    let module = rt.load_source("adder", ADDER).unwrap();

    let total = module.get("total").unwrap();
    assert_eq!(rt.call_guarded(&total, vec![Value::Int(3), Value::Int(4)]).unwrap().as_int(), Some(8));
    let report = &rt.history()[0];
    assert!(report.reached(WorkflowState::RejectedByUser));
    assert!(report.reached(WorkflowState::Edited));
    assert!(!report.reached(WorkflowState::Confirmed));
}

#[test]
fn test_edited_suggestion_is_applied() {
    let generator = Arc::new(StaticGenerator::new().with("add", "def add(a, b):\n    return a * b\n"));
    let surface = Arc::new(ScriptedSurface::new().then_review(Review::Edit("def add(a, b):\n    return a - b\n".into())));
    let mut rt = runtime_with(Some(generator), surface, Settings::default());
    let module = rt.load_source("adder", ADDER).unwrap();

    let plus = module.get("plus").unwrap();
    assert_eq!(rt.call_guarded(&plus, vec![Value::Int(3), Value::Int(4)]).unwrap().as_int(), Some(-1));
    assert!(rt.history()[0].reached(WorkflowState::Edited));
}

#[test]
fn test_generator_failure_falls_back_to_manual() {
    let generator = Arc::new(StaticGenerator::new());
    let surface = Arc::new(ScriptedSurface::new().then_author(Some("def add(a, b):\n    return 7\n")));
    let mut rt = runtime_with(Some(generator), surface.clone(), Settings::default());
    let module = rt.load_source("adder", ADDER).unwrap();

    let plus = module.get("plus").unwrap();
    assert_eq!(rt.call_guarded(&plus, vec![Value::Int(0), Value::Int(0)]).unwrap().as_int(), Some(7));

    let report = &rt.history()[0];
    assert!(report.reached(WorkflowState::Declined));
    assert!(!report.reached(WorkflowState::Suggested));
    assert!(surface
        .notices()
        .iter()
        .any(|n| n.contains("generator unavailable") && n.contains("falling back")));
}

#[test]
fn test_generator_timeout_falls_back_to_manual() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        let mut held = Vec::new();
        for stream in listener.incoming() {
            held.push(stream);
        }
    });
    let generator = OpenRouterGenerator::new("sk-test".into(), "m".into(), Duration::from_secs(1))
        .unwrap()
        .with_base_url(&format!("http://{}/v1", addr));

    let surface = Arc::new(ScriptedSurface::new().then_author(Some("def add(a, b):\n    return a - b\n")));
    let mut rt = runtime_with(Some(Arc::new(generator)), surface.clone(), Settings::default());
    let module = rt.load_source("adder", ADDER).unwrap();

    let plus = module.get("plus").unwrap();
    assert_eq!(rt.call_guarded(&plus, vec![Value::Int(9), Value::Int(4)]).unwrap().as_int(), Some(5));

    let report = &rt.history()[0];
    assert_eq!(
        &report.transitions[2..5],
        &[WorkflowState::Requesting, WorkflowState::Declined, WorkflowState::Edited]
    );
    assert!(surface.notices().iter().any(|n| n.contains("timed out after 1s")));
    assert_eq!(surface.events(), vec!["generate?:add", "author:add"]);
}

const TEN_LINES: &str = "\
# calculator helpers
SCALE = 2

def scaled_sum(a, b):
    \"\"\"Sum then scale.\"\"\"
    raise NotImplementedError


def identity(x):
    return x
";

const FIVE_LINE_BODY: &str = "\
def scaled_sum(a, b):
    \"\"\"Sum then scale.\"\"\"
    total = a + b
    total = total * SCALE
    return total
";

#[test]
fn test_durable_patch_rewrites_range_without_replay() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("helpers.py");
    fs::write(&path, TEN_LINES).unwrap();

    let generator = Arc::new(StaticGenerator::new().with("scaled_sum", FIVE_LINE_BODY));
    let settings = Settings::default().with_durability(Durability::Durable);
    let mut rt = runtime_with(Some(generator), Arc::new(ScriptedSurface::new()), settings);
    let module = rt.run_guarded(&path).unwrap();

    let f = module.get("scaled_sum").unwrap();
    assert_eq!(
        script_error_kind(rt.call_guarded(&f, vec![Value::Int(3), Value::Int(4)])),
        "NotImplementedError"
    );
    let report = &rt.history()[0];
    assert_eq!(
        report.outcome,
        PatchOutcome::Applied {
            durability: Durability::Durable,
            replayed: false
        }
    );
    assert_eq!(report.final_state(), Some(WorkflowState::Propagated));

    let before: Vec<&str> = TEN_LINES.lines().collect();
    let text = fs::read_to_string(&path).unwrap();
    let after: Vec<&str> = text.lines().collect();
    assert_eq!(after.len(), 12);
    assert_eq!(&after[..3], &before[..3]);
    assert_eq!(after[3..8].join("\n") + "\n", FIVE_LINE_BODY);
    assert_eq!(&after[8..], &before[6..]);

    // A fresh process picks the rewritten body up from the file.
    let mut fresh = runtime_with(None, Arc::new(ScriptedSurface::declining()), Settings::default());
    let module = fresh.run_guarded(&path).unwrap();
    let f = module.get("scaled_sum").unwrap();
    assert_eq!(fresh.call(&f, vec![Value::Int(3), Value::Int(4)]).unwrap().as_int(), Some(14));
}

#[test]
fn test_both_rewrites_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("helpers.py");
    fs::write(&path, TEN_LINES).unwrap();

    let generator = Arc::new(StaticGenerator::new().with("scaled_sum", FIVE_LINE_BODY));
    let settings = Settings::default().with_durability(Durability::Both);
    let mut rt = runtime_with(Some(generator), Arc::new(ScriptedSurface::new()), settings);
    let module = rt.run_guarded(&path).unwrap();

    let f = module.get("scaled_sum").unwrap();
    assert_eq!(rt.call_guarded(&f, vec![Value::Int(3), Value::Int(4)]).unwrap().as_int(), Some(14));
    assert!(fs::read_to_string(&path).unwrap().contains("total = total * SCALE"));
    assert_eq!(
        rt.history()[0].outcome,
        PatchOutcome::Applied {
            durability: Durability::Both,
            replayed: true
        }
    );
}

#[test]
fn test_durable_falls_back_to_ephemeral_without_a_file() {
    let generator = Arc::new(StaticGenerator::new().with("add", "def add(a, b):\n    return a * b\n"));
    let surface = Arc::new(ScriptedSurface::new());
    let settings = Settings::default().with_durability(Durability::Durable);
    let mut rt = runtime_with(Some(generator), surface.clone(), settings);
    let module = rt.load_source("adder", ADDER).unwrap();

    let total = module.get("total").unwrap();
    assert_eq!(rt.call_guarded(&total, vec![Value::Int(2), Value::Int(5)]).unwrap().as_int(), Some(11));
    assert_eq!(
        rt.history()[0].outcome,
        PatchOutcome::Applied {
            durability: Durability::Ephemeral,
            replayed: true
        }
    );
    assert!(surface.notices().iter().any(|n| n.starts_with("Could not rewrite <adder>")));
}

#[test]
fn test_chain_is_truncated_to_the_last_ten_frames() {
    let mut src = String::new();
    for i in 0..24 {
        src.push_str(&format!("def f{}(n):\n    return f{}(n)\n\n", i, i + 1));
    }
    src.push_str("def f24(n):\n    raise NotImplementedError\n");

    let generator = Arc::new(RecordingGenerator::new(
        StaticGenerator::new().with("f24", "def f24(n):\n    return n + 100\n"),
    ));
    let mut rt = runtime_with(Some(generator.clone()), Arc::new(ScriptedSurface::new()), Settings::default());
    let module = rt.load_source("deep", &src).unwrap();

    let f0 = module.get("f0").unwrap();
    assert_eq!(rt.call_guarded(&f0, vec![Value::Int(1)]).unwrap().as_int(), Some(101));

    let chains = lock(&generator.chains).clone();
    let expected: Vec<String> = (15..25).map(|i| format!("f{}", i)).collect();
    assert_eq!(chains[0], expected);
}

#[test]
fn test_requests_are_identical_across_runs() {
    let run = || {
        let generator = Arc::new(RecordingGenerator::new(
            StaticGenerator::new().with("add", "def add(a, b):\n    return a * b\n"),
        ));
        let mut rt = runtime_with(Some(generator.clone()), Arc::new(ScriptedSurface::new()), Settings::default());
        let module = rt.load_source("adder", ADDER).unwrap();
        let total = module.get("total").unwrap();
        rt.call_guarded(&total, vec![Value::Int(1), Value::Int(1)]).unwrap();
        let descriptions = lock(&generator.descriptions).clone();
        descriptions
    };
    let first = run();
    assert_eq!(first.len(), 1);
    assert_eq!(first, run());
    assert!(first[0].contains("[depth 0] total at <adder>:7"));
}

#[test]
fn test_methods_and_nested_functions_are_attributed() {
    let src = "\
class Counter:
    def __init__(self):
        self.n = 0

    def bump(self, k):
        raise NotImplementedError

def use_counter():
    c = Counter()
    c.bump(2)
    return c.bump(3)

def outer(v):
    def inner(w):
        raise NotImplementedError
    return inner(v)
";
    let generator = Arc::new(
        StaticGenerator::new()
            .with("Counter.bump", "def bump(self, k):\n    self.n = self.n + k\n    return self.n\n")
            .with("outer.<locals>.inner", "def inner(w):\n    return w * 3\n"),
    );
    let mut rt = runtime_with(Some(generator.clone()), Arc::new(ScriptedSurface::new()), Settings::default());
    let module = rt.load_source("attrib", src).unwrap();

    let use_counter = module.get("use_counter").unwrap();
    assert_eq!(rt.call_guarded(&use_counter, vec![]).unwrap().as_int(), Some(5));
    let outer = module.get("outer").unwrap();
    assert_eq!(rt.call_guarded(&outer, vec![Value::Int(4)]).unwrap().as_int(), Some(12));

    assert_eq!(
        generator.requests(),
        vec!["Counter.bump".to_string(), "outer.<locals>.inner".to_string()]
    );
}

#[test]
fn test_with_statement_opens_a_boundary() {
    let src = "\
def foo():
    return bar() + 1

def bar():
    raise NotImplementedError(\"Coming soon!\")

with not_implemented_handler():
    result = foo()
print(result)
";
    let generator = Arc::new(StaticGenerator::new().with("bar", "def bar():\n    return 41\n"));
    let mut rt = runtime_with(Some(generator), Arc::new(ScriptedSurface::new()), Settings::default());
    rt.load_source("script", src).unwrap();
    assert_eq!(rt.interpreter().output().contents(), "42\n");
    assert_eq!(rt.history().len(), 1);
}

#[test]
fn test_no_boundary_means_no_interception() {
    let generator = Arc::new(StaticGenerator::new().with("add", "def add(a, b):\n    return a * b\n"));
    let mut rt = runtime_with(Some(generator.clone()), Arc::new(ScriptedSurface::new()), Settings::default());
    let module = rt.load_source("adder", ADDER).unwrap();

    let total = module.get("total").unwrap();
    assert_eq!(
        script_error_kind(rt.call(&total, vec![Value::Int(1), Value::Int(2)])),
        "NotImplementedError"
    );
    assert!(rt.history().is_empty());
    assert!(generator.requests().is_empty());
}

#[test]
fn test_default_stub_when_manual_input_is_empty() {
    let src = "def greet(name):\n    raise NotImplementedError\n";
    let settings = Settings {
        default_stub_on_empty: true,
        ..Settings::default()
    };
    let mut rt = runtime_with(None, Arc::new(ScriptedSurface::new()), settings);
    let module = rt.load_source("greet", src).unwrap();

    let greet = module.get("greet").unwrap();
    let value = rt.call_guarded(&greet, vec![Value::str("ada")]).unwrap();
    assert_eq!(value.as_str(), Some("Default result from greet"));
    assert_eq!(rt.interpreter().output().contents(), "Default implementation: greet called\n");
}

#[test]
fn test_replay_exception_reaches_caller() {
    let generator = Arc::new(StaticGenerator::new().with(
        "add",
        "def add(a, b):\n    raise ValueError(\"bad operands\")\n",
    ));
    let mut rt = runtime_with(Some(generator), Arc::new(ScriptedSurface::new()), Settings::default());
    let module = rt.load_source("adder", ADDER).unwrap();

    let total = module.get("total").unwrap();
    assert_eq!(
        script_error_kind(rt.call_guarded(&total, vec![Value::Int(1), Value::Int(2)])),
        "ValueError"
    );
    let report = &rt.history()[0];
    assert!(report.reached(WorkflowState::Applied));
    assert_eq!(report.final_state(), Some(WorkflowState::Propagated));
    assert_eq!(report.error.as_deref(), Some("ValueError: bad operands"));
}

#[test]
fn test_candidate_that_is_still_a_placeholder_propagates() {
    let generator = Arc::new(StaticGenerator::new().with("add", "def add(a, b):\n    raise NotImplementedError\n"));
    let mut rt = runtime_with(Some(generator.clone()), Arc::new(ScriptedSurface::new()), Settings::default());
    let module = rt.load_source("adder", ADDER).unwrap();

    let total = module.get("total").unwrap();
    assert_eq!(
        script_error_kind(rt.call_guarded(&total, vec![Value::Int(1), Value::Int(2)])),
        "NotImplementedError"
    );
    assert_eq!(rt.history().len(), 1);
    assert_eq!(generator.requests().len(), 1);
}
