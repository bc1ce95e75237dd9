//! Unit tests for the incremental response stream parser.

use agent_conduit::stream::{ResponseOutcome, StreamEvent, StreamParser, Usage};

#[test]
fn delta_then_stop_completes_with_content() {
    let mut parser = StreamParser::new();

    let first = parser.feed(r#"{"type":"delta","text":"hi"}"#);
    assert_eq!(
        first,
        Some(StreamEvent::PartialContent { text: "hi".into() })
    );

    let second = parser.feed(r#"{"type":"stop"}"#).expect("terminal event");
    assert!(second.is_terminal());
    assert!(matches!(second, StreamEvent::Completion { terminal: true, .. }));

    let response = parser.into_response();
    assert_eq!(response.content, "hi");
    assert_eq!(response.outcome, ResponseOutcome::Completed);
}

#[test]
fn partial_content_preserves_fragments_exactly() {
    let mut parser = StreamParser::new();
    parser.feed(r#"{"type":"delta","text":"Hello, "}"#);
    parser.feed(r#"{"type":"text","text":" world "}"#);
    parser.feed(r#"{"type":"stop"}"#);

    assert_eq!(parser.into_response().content, "Hello,  world ");
}

#[test]
fn malformed_line_is_reported_and_stream_continues() {
    let mut parser = StreamParser::new();

    let event = parser.feed("{not json").expect("decode failure event");
    match &event {
        StreamEvent::Error {
            raw_line,
            decode_failure,
            ..
        } => {
            assert!(*decode_failure);
            assert_eq!(raw_line.as_deref(), Some("{not json"));
        }
        other => panic!("expected decode failure, got {other:?}"),
    }
    assert!(!event.is_terminal());
    assert!(!parser.is_closed());

    parser.feed(r#"{"type":"delta","text":"ok"}"#);
    parser.feed(r#"{"type":"stop"}"#);

    let response = parser.into_response();
    assert_eq!(response.content, "ok");
    assert_eq!(response.decode_failures, 1);
    assert!(response.is_complete());
}

#[test]
fn delta_without_text_is_a_decode_failure() {
    let mut parser = StreamParser::new();
    let event = parser.feed(r#"{"type":"delta"}"#).expect("event");
    assert!(matches!(
        event,
        StreamEvent::Error {
            decode_failure: true,
            ..
        }
    ));
}

#[test]
fn tool_use_accepts_input_alias() {
    let mut parser = StreamParser::new();
    let event = parser
        .feed(r#"{"type":"tool_use","name":"read_file","input":{"path":"a.rs"}}"#)
        .expect("tool event");

    let StreamEvent::ToolInvocation(tool) = event else {
        panic!("expected tool invocation");
    };
    assert_eq!(tool.name, "read_file");
    assert_eq!(tool.arguments["path"], "a.rs");

    parser.feed(r#"{"type":"stop"}"#);
    assert_eq!(parser.into_response().tool_calls.len(), 1);
}

#[test]
fn error_record_is_terminal() {
    let mut parser = StreamParser::new();
    let event = parser
        .feed(r#"{"type":"error","message":"rate limited"}"#)
        .expect("error event");

    assert!(event.is_terminal());
    assert!(parser.is_closed());
    assert_eq!(
        parser.into_response().outcome,
        ResponseOutcome::Failed("rate limited".into())
    );
}

#[test]
fn result_with_is_error_fails_the_stream() {
    let mut parser = StreamParser::new();
    let event = parser
        .feed(r#"{"type":"result","is_error":true,"result":"tool crashed"}"#)
        .expect("event");

    assert!(event.is_terminal());
    assert!(matches!(event, StreamEvent::Error { decode_failure: false, .. }));
}

#[test]
fn lines_after_terminal_event_are_ignored() {
    let mut parser = StreamParser::new();
    parser.feed(r#"{"type":"delta","text":"a"}"#);
    parser.feed(r#"{"type":"stop"}"#);

    assert_eq!(parser.feed(r#"{"type":"delta","text":"late"}"#), None);
    assert_eq!(parser.feed(r#"{"type":"stop"}"#), None);
    assert_eq!(parser.into_response().content, "a");
}

#[test]
fn close_without_terminal_emits_synthetic_error() {
    let mut parser = StreamParser::new();
    parser.feed(r#"{"type":"delta","text":"partial"}"#);

    let event = parser.close().expect("synthetic terminal");
    assert!(event.is_terminal());
    assert!(matches!(event, StreamEvent::Error { decode_failure: false, .. }));
    assert_eq!(parser.close(), None);

    let response = parser.into_response();
    assert_eq!(response.content, "partial");
    assert!(!response.is_complete());
}

#[test]
fn close_after_completion_emits_nothing() {
    let mut parser = StreamParser::new();
    parser.feed(r#"{"type":"stop"}"#);
    assert_eq!(parser.close(), None);
}

#[test]
fn unknown_types_and_blank_lines_are_skipped() {
    let mut parser = StreamParser::new();
    assert_eq!(parser.feed(""), None);
    assert_eq!(parser.feed("   "), None);
    assert_eq!(parser.feed(r#"{"type":"system","subtype":"init"}"#), None);
    assert!(!parser.is_closed());
    assert_eq!(parser.into_response().decode_failures, 0);
}

#[test]
fn completion_reports_aggregated_usage() {
    let mut parser = StreamParser::new();
    parser.feed(r#"{"type":"delta","text":"x","usage":{"input_tokens":10,"output_tokens":4}}"#);
    let event = parser
        .feed(r#"{"type":"stop","usage":{"output_tokens":6,"cost_usd":0.5}}"#)
        .expect("completion");

    let StreamEvent::Completion { usage, .. } = event else {
        panic!("expected completion");
    };
    assert_eq!(
        usage,
        Usage {
            input_tokens: 10,
            output_tokens: 10,
            cost_usd: Some(0.5),
        }
    );
    assert_eq!(usage.total_tokens(), 20);
}

#[test]
fn events_serialize_with_type_tag() {
    let event = StreamEvent::PartialContent { text: "hi".into() };
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "partial_content");
    assert_eq!(json["text"], "hi");
}

#[test]
fn usage_on_a_rejected_record_is_not_counted() {
    let mut parser = StreamParser::new();
    parser.feed(r#"{"type":"delta","usage":{"input_tokens":100,"output_tokens":100}}"#);
    parser.feed(r#"{"type":"tool_use","usage":{"output_tokens":9}}"#);
    parser.feed(r#"{"type":"delta","text":"a","usage":{"input_tokens":2,"output_tokens":1}}"#);
    let completion = parser.feed(r#"{"type":"stop","usage":{"output_tokens":1}}"#);

    assert_eq!(
        completion,
        Some(StreamEvent::Completion {
            terminal: true,
            usage: Usage {
                input_tokens: 2,
                output_tokens: 2,
                cost_usd: None,
            },
        })
    );
    assert_eq!(parser.into_response().decode_failures, 2);
}
