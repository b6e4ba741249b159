//! End-to-end scheduling behavior against the scripted mock engine.

use std::sync::Arc;
use std::time::Duration;

use spate_common::config::CoreConfig;
use spate_core::request::OutputEvent;
use spate_core::sequence::SamplingParams;
use spate_core::{ChannelSink, Choice, Core, CoreHandle, FinishReason, RequestInput, RequestSpec, Usage};
use spate_engine::mock::{MockEngine, MockTokenizer};
use spate_engine::{EngineError, EngineErrorKind, RoleTagTemplate};
use tokio::sync::mpsc::Receiver;
use tokio::time::timeout;

fn test_config() -> CoreConfig {
    CoreConfig {
        block_size: 4,
        num_blocks: Some(64),
        max_batch_tokens: 256,
        max_seqs_per_batch: 16,
        step_timeout_ms: 2,
        sink_grace_ms: 200,
        ..Default::default()
    }
}

fn start(engine: Arc<MockEngine>, cfg: CoreConfig) -> CoreHandle {
    Core::start(engine, Arc::new(MockTokenizer), Arc::new(RoleTagTemplate), cfg).expect("core start")
}

fn greedy(max_tokens: usize) -> SamplingParams {
    SamplingParams { temperature: 0.0, max_tokens, seed: Some(0), ..Default::default() }
}

fn spec(prompt: &str, sampling: SamplingParams) -> RequestSpec {
    RequestSpec::prompt(prompt, sampling)
}

async fn next_event(rx: &mut Receiver<OutputEvent>) -> OutputEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skip deltas until the terminal event.
async fn final_event(rx: &mut Receiver<OutputEvent>) -> OutputEvent {
    loop {
        match next_event(rx).await {
            ev @ (OutputEvent::Finish { .. } | OutputEvent::Rejected { .. }) => return ev,
            OutputEvent::Delta { .. } => {}
        }
    }
}

async fn finish_of(rx: &mut Receiver<OutputEvent>) -> (Vec<Choice>, Usage) {
    match final_event(rx).await {
        OutputEvent::Finish { choices, usage } => (choices, usage),
        other => panic!("expected finish, got {other:?}"),
    }
}

async fn run_one(core: &CoreHandle, prompt: &str, sampling: SamplingParams) -> (Vec<Choice>, Usage) {
    let (sink, mut rx) = ChannelSink::new(64);
    core.submit(spec(prompt, sampling), Box::new(sink)).await;
    finish_of(&mut rx).await
}

#[tokio::test]
async fn single_greedy_runs_to_length() {
    let engine = Arc::new(MockEngine::new());
    engine.script("A", "xyzw");
    let core = start(engine.clone(), test_config());

    let (choices, usage) = run_one(&core, "A", greedy(3)).await;
    assert_eq!(choices.len(), 1);
    assert_eq!(choices[0].text, "xyz");
    assert_eq!(choices[0].finish_reason, FinishReason::Length);
    assert_eq!(choices[0].num_tokens, 3);
    assert!(choices[0].cumulative_logprob <= 0.0);
    assert_eq!(usage.prompt_tokens, 1);
    assert_eq!(usage.completion_tokens, 3);
    assert_eq!(usage.total_tokens, 4);
}

#[tokio::test]
async fn stop_string_truncates_delivered_text() {
    let engine = Arc::new(MockEngine::new());
    engine.script("hi", "there!world");
    let core = start(engine.clone(), test_config());

    let params = SamplingParams {
        temperature: 0.0,
        max_tokens: 20,
        stop: vec!["!".into()],
        ..Default::default()
    };
    let (choices, _) = run_one(&core, "hi", params).await;
    assert_eq!(choices[0].text, "there");
    assert_eq!(choices[0].finish_reason, FinishReason::Stop);
}

#[tokio::test]
async fn max_tokens_one_generates_exactly_one_token() {
    let engine = Arc::new(MockEngine::new());
    engine.script("go", "abc");
    let core = start(engine.clone(), test_config());

    let (choices, usage) = run_one(&core, "go", greedy(1)).await;
    assert_eq!(choices[0].num_tokens, 1);
    assert_eq!(choices[0].text, "a");
    assert_eq!(choices[0].finish_reason, FinishReason::Length);
    assert_eq!(usage.completion_tokens, 1);
}

#[tokio::test]
async fn eos_finishes_with_stop() {
    let engine = Arc::new(MockEngine::new());
    // two scripted tokens, then the script is exhausted and EOS follows
    engine.script("s", "ok");
    let core = start(engine.clone(), test_config());

    let (choices, _) = run_one(&core, "s", greedy(10)).await;
    assert_eq!(choices[0].text, "ok");
    assert_eq!(choices[0].finish_reason, FinishReason::Stop);
    assert_eq!(choices[0].num_tokens, 3);
}

#[tokio::test]
async fn identical_seeded_submissions_are_identical() {
    let engine = Arc::new(MockEngine::new());
    engine.script("twin", "abcdefgh");
    let core = start(engine.clone(), test_config());

    let params = SamplingParams { max_tokens: 6, seed: Some(7), ..Default::default() };
    let (a, _) = run_one(&core, "twin", params.clone()).await;
    let (b, _) = run_one(&core, "twin", params).await;
    assert_eq!(a[0].text, b[0].text);
    assert_eq!(a[0].cumulative_logprob, b[0].cumulative_logprob);
}

#[tokio::test]
async fn preemption_under_pressure_matches_sequential_outputs() {
    // 4 blocks of 4 tokens: the three requests cannot all stay resident
    let cfg = CoreConfig {
        block_size: 4,
        num_blocks: Some(4),
        max_batch_tokens: 64,
        step_timeout_ms: 2,
        ..test_config()
    };
    let prompts = ["aaaaaaaa", "bbbb", "cccc"];

    let sequential_engine = Arc::new(MockEngine::new());
    for p in prompts {
        sequential_engine.script(p, "12345678");
    }
    let core = start(sequential_engine.clone(), cfg.clone());
    let mut expected = Vec::new();
    for p in prompts {
        let (choices, _) = run_one(&core, p, greedy(8)).await;
        expected.push(choices[0].text.clone());
    }
    drop(core);

    let preempted_before = spate_obs::preemptions_total();
    let engine = Arc::new(MockEngine::new());
    for p in prompts {
        engine.script(p, "12345678");
    }
    let core = start(engine.clone(), cfg);
    let mut rxs = Vec::new();
    for p in prompts {
        let (sink, rx) = ChannelSink::new(64);
        core.submit(spec(p, greedy(8)), Box::new(sink)).await;
        rxs.push(rx);
    }
    for (rx, expected_text) in rxs.iter_mut().zip(&expected) {
        let (choices, _) = finish_of(rx).await;
        assert_eq!(choices[0].finish_reason, FinishReason::Length);
        assert_eq!(&choices[0].text, expected_text);
    }
    assert!(
        spate_obs::preemptions_total() > preempted_before,
        "pool pressure should have preempted at least one request"
    );
}

#[tokio::test]
async fn best_of_returns_the_single_ranked_choice() {
    let engine = Arc::new(MockEngine::new());
    engine.script("x", "mmmmmm");
    let core = start(engine.clone(), test_config());

    let params = SamplingParams {
        n: 1,
        best_of: Some(3),
        max_tokens: 4,
        seed: Some(0),
        ..Default::default()
    };
    let (choices, usage) = run_one(&core, "x", params).await;
    assert_eq!(choices.len(), 1);
    assert_eq!(choices[0].num_tokens, 4);
    // every sibling's tokens are accounted, not just the survivor's
    assert_eq!(usage.completion_tokens, 12);
}

#[tokio::test]
async fn best_of_one_is_indistinguishable_from_plain() {
    let engine = Arc::new(MockEngine::new());
    engine.script("p", "qrstuv");
    let core = start(engine.clone(), test_config());

    let plain = SamplingParams { max_tokens: 5, seed: Some(3), ..Default::default() };
    let explicit = SamplingParams { best_of: Some(1), ..plain.clone() };
    let (a, ua) = run_one(&core, "p", plain).await;
    let (b, ub) = run_one(&core, "p", explicit).await;
    assert_eq!(a[0].text, b[0].text);
    assert_eq!(a[0].cumulative_logprob, b[0].cumulative_logprob);
    assert_eq!(ua.completion_tokens, ub.completion_tokens);
}

#[tokio::test]
async fn cancellation_mid_stream_releases_and_goes_quiet() {
    let engine = Arc::new(MockEngine::new());
    let core = start(engine.clone(), test_config());

    let params = SamplingParams { temperature: 0.0, max_tokens: 1000, seed: Some(0), ..Default::default() };
    let mut req = spec("zz", params);
    req.stream = true;
    let (sink, mut rx) = ChannelSink::new(256);
    let handle = core.submit(req, Box::new(sink)).await;

    let mut deltas = 0;
    while deltas < 5 {
        if let OutputEvent::Delta { .. } = next_event(&mut rx).await {
            deltas += 1;
        }
    }
    handle.cancel();

    let (choices, _) = finish_of(&mut rx).await;
    assert_eq!(choices[0].finish_reason, FinishReason::Cancelled);
    // nothing after the terminal event; the sink closes once delivered
    let after = timeout(Duration::from_secs(2), rx.recv()).await;
    assert!(matches!(after, Ok(None)), "unexpected event after cancellation: {after:?}");
}

#[tokio::test]
async fn streamed_siblings_arrive_in_index_order() {
    let engine = Arc::new(MockEngine::new());
    engine.script("q", "abcde");
    let core = start(engine.clone(), test_config());

    let params = SamplingParams { temperature: 0.0, n: 3, max_tokens: 5, seed: Some(0), ..Default::default() };
    let mut req = spec("q", params);
    req.stream = true;
    let (sink, mut rx) = ChannelSink::new(256);
    core.submit(req, Box::new(sink)).await;

    let mut indices: Vec<usize> = Vec::new();
    let mut first_delta_empty = [false; 3];
    let mut seen = [false; 3];
    loop {
        match next_event(&mut rx).await {
            OutputEvent::Delta { index, text, .. } => {
                if !seen[index] {
                    seen[index] = true;
                    first_delta_empty[index] = text.is_empty();
                }
                indices.push(index);
            }
            OutputEvent::Finish { choices, .. } => {
                assert_eq!(choices.len(), 3);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(first_delta_empty.iter().all(|&b| b), "each sequence announces with an empty delta");
    // within a step, deltas are ordered by sequence index; a drop back to
    // index 0 marks a step boundary
    let mut prev = None;
    for &idx in &indices {
        if let Some(p) = prev {
            assert!(idx >= p || idx == 0, "out-of-order delta: {p} then {idx}");
        }
        prev = Some(idx);
    }
    let count = |i: usize| indices.iter().filter(|&&x| x == i).count();
    // one announce plus five content deltas (the last carries the finish)
    for i in 0..3 {
        assert_eq!(count(i), 6, "sequence {i} delta count");
    }
}

#[tokio::test]
async fn overlong_prompt_is_rejected_at_admission() {
    let engine = Arc::new(MockEngine::new());
    let cfg = CoreConfig { max_context_len: 16, ..test_config() };
    let core = start(engine.clone(), cfg);

    let (sink, mut rx) = ChannelSink::new(8);
    let handle = core.submit(spec(&"a".repeat(64), greedy(4)), Box::new(sink)).await;
    assert!(matches!(final_event(&mut rx).await, OutputEvent::Rejected { .. }));
    assert!(handle.is_cancelled());
}

#[tokio::test]
async fn invalid_params_are_rejected_at_admission() {
    let engine = Arc::new(MockEngine::new());
    let core = start(engine.clone(), test_config());

    let (sink, mut rx) = ChannelSink::new(8);
    core.submit(spec("ok", SamplingParams { max_tokens: 0, ..Default::default() }), Box::new(sink))
        .await;
    assert!(matches!(final_event(&mut rx).await, OutputEvent::Rejected { .. }));

    let (sink, mut rx) = ChannelSink::new(8);
    let mut streaming_best_of = spec(
        "ok",
        SamplingParams { n: 1, best_of: Some(2), ..Default::default() },
    );
    streaming_best_of.stream = true;
    core.submit(streaming_best_of, Box::new(sink)).await;
    assert!(matches!(final_event(&mut rx).await, OutputEvent::Rejected { .. }));
}

#[tokio::test]
async fn engine_failure_marks_the_batch_with_error() {
    let engine = Arc::new(MockEngine::new());
    engine.script("f", "abc");
    engine.fail_next(EngineError { kind: EngineErrorKind::Device, message: "device lost".into() });
    let core = start(engine.clone(), test_config());

    let (choices, usage) = run_one(&core, "f", greedy(3)).await;
    assert_eq!(choices[0].finish_reason, FinishReason::Error);
    assert_eq!(usage.completion_tokens, 0);

    // the scheduler keeps serving after a failed step
    let (choices, _) = run_one(&core, "f", greedy(3)).await;
    assert_eq!(choices[0].finish_reason, FinishReason::Length);
    assert_eq!(choices[0].text, "abc");
}

#[tokio::test]
async fn refusing_sink_cancels_after_grace() {
    let engine = Arc::new(MockEngine::new());
    let cfg = CoreConfig { sink_grace_ms: 100, ..test_config() };
    let core = start(engine.clone(), cfg);

    let cancelled_before = spate_obs::requests_cancelled_total();
    let params = SamplingParams { temperature: 0.0, max_tokens: 1000, seed: Some(0), ..Default::default() };
    let mut req = spec("bp", params);
    req.stream = true;
    // capacity-1 sink that nobody drains: one event lands, the rest refuse
    let (sink, rx) = ChannelSink::new(1);
    core.submit(req, Box::new(sink)).await;

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while spate_obs::requests_cancelled_total() == cancelled_before {
        assert!(std::time::Instant::now() < deadline, "backpressured request was never cancelled");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    drop(rx);
}

#[tokio::test]
async fn chat_messages_render_through_the_template() {
    let engine = Arc::new(MockEngine::new());
    let core = start(engine.clone(), test_config());

    let rendered = "user: hi\nassistant: ";
    engine.script(rendered, "hello");
    let req = RequestSpec {
        input: RequestInput::Messages(vec![spate_engine::ChatMessage {
            role: "user".into(),
            content: "hi".into(),
        }]),
        sampling: greedy(5),
        priority: Default::default(),
        stream: false,
    };
    let (sink, mut rx) = ChannelSink::new(64);
    core.submit(req, Box::new(sink)).await;
    let (choices, usage) = finish_of(&mut rx).await;
    assert_eq!(choices[0].text, "hello");
    assert_eq!(usage.prompt_tokens, rendered.len());
}
