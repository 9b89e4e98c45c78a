//! Typed inbound events from the target agent.

use crate::error::{Error, Result};
use crate::wire::Value;

/// One decoded event off the event queue.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Attach acknowledged; carries the controller pid the target now obeys.
    Attached { pid: u64 },
    /// Detach acknowledged.
    Detached { pid: u64 },
    /// First reference to a method id; interns its name.
    Method { id: i64, name: String },
    /// First reference to a class id; interns its name.
    Class { id: i64, name: String },
    /// Tracer installed, or refused when `tracer` is -1.
    TracerAdded { tracer: i64, query: String },
    /// Argument expression bound to a tracer.
    NewExpr { tracer: i64, expr: i64, source: String },
    /// Evaluated argument value for the tracer's next call.
    ExprVal { tracer: i64, expr: i64, value: String },
    /// Method entered (`call` for wall time, `ccall` for cpu time).
    Call {
        time: u64,
        tracer: i64,
        mid: i64,
        singleton: bool,
        klass: i64,
    },
    /// Method exited.
    Return { time: u64, tracer: i64 },
    /// Completed call that exceeded the slow threshold.
    Slow {
        time: u64,
        elapsed: u64,
        depth: u64,
        mid: i64,
        singleton: bool,
        klass: i64,
    },
    GcStart { time: u64 },
    GcEnd { time: u64 },
    /// GC mark tick.
    Gc { time: u64 },
    /// The target is collecting and cannot drain commands promptly.
    DuringGc,
    /// Reply to an `eval` command.
    Evaled { result: String },
    /// Reply to a `fork` command.
    Forked { pid: u64 },
    /// Anything this controller does not understand.
    Unknown { name: String, args: Vec<Value> },
}

impl Event {
    /// Interpret one decoded message body.
    ///
    /// Unknown tags parse as [`Event::Unknown`]. A known tag with a bad
    /// payload is an error: trace state coherence depends on every known
    /// event being interpreted, so the stream cannot be trusted past it.
    pub fn parse(value: Value) -> Result<Event> {
        let Value::Array(items) = value else {
            return Err(malformed("event", "not an array"));
        };

        let mut items = items.into_iter();
        let name = match items.next() {
            Some(Value::Str(name)) => name,
            _ => return Err(malformed("event", "missing tag")),
        };

        let mut args = Args {
            event: &name,
            items,
        };

        match Event::from_tag(name.as_str(), &mut args)? {
            Some(event) => Ok(event),
            None => {
                let rest = args.rest();
                Ok(Event::Unknown { name, args: rest })
            }
        }
    }

    fn from_tag(tag: &str, args: &mut Args<'_>) -> Result<Option<Event>> {
        let event = match tag {
            "attached" => Event::Attached { pid: args.uint()? },
            "detached" => Event::Detached { pid: args.uint()? },
            "mid" => Event::Method {
                id: args.int()?,
                name: args.str()?,
            },
            "klass" => Event::Class {
                id: args.int()?,
                name: args.str()?,
            },
            "add" => Event::TracerAdded {
                tracer: args.int()?,
                query: args.str()?,
            },
            "newexpr" => Event::NewExpr {
                tracer: args.int()?,
                expr: args.int()?,
                source: args.str()?,
            },
            "exprval" => Event::ExprVal {
                tracer: args.int()?,
                expr: args.int()?,
                value: args.display()?,
            },
            "call" | "ccall" => Event::Call {
                time: args.uint()?,
                tracer: args.int()?,
                mid: args.int()?,
                singleton: args.bool()?,
                klass: args.int()?,
            },
            "return" | "creturn" => Event::Return {
                time: args.uint()?,
                tracer: args.int()?,
            },
            "slow" | "cslow" => Event::Slow {
                time: args.uint()?,
                elapsed: args.uint()?,
                depth: args.uint()?,
                mid: args.int()?,
                singleton: args.bool()?,
                klass: args.int()?,
            },
            "gc_start" => Event::GcStart { time: args.uint()? },
            "gc_end" => Event::GcEnd { time: args.uint()? },
            "gc" => Event::Gc { time: args.uint()? },
            "during_gc" => Event::DuringGc,
            "evaled" => Event::Evaled {
                result: args.display()?,
            },
            "forked" => Event::Forked { pid: args.uint()? },
            _ => return Ok(None),
        };

        Ok(Some(event))
    }
}

struct Args<'a> {
    event: &'a str,
    items: std::vec::IntoIter<Value>,
}

impl Args<'_> {
    fn next(&mut self) -> Result<Value> {
        self.items
            .next()
            .ok_or_else(|| malformed(self.event, "missing argument"))
    }

    fn int(&mut self) -> Result<i64> {
        match self.next()? {
            Value::Int(n) => Ok(n),
            _ => Err(malformed(self.event, "expected an integer")),
        }
    }

    fn uint(&mut self) -> Result<u64> {
        let n = self.int()?;
        u64::try_from(n).map_err(|_| malformed(self.event, "expected a non-negative integer"))
    }

    fn str(&mut self) -> Result<String> {
        match self.next()? {
            Value::Str(s) => Ok(s),
            _ => Err(malformed(self.event, "expected a string")),
        }
    }

    // Some agents pack booleans as 0/1.
    fn bool(&mut self) -> Result<bool> {
        match self.next()? {
            Value::Bool(b) => Ok(b),
            Value::Int(0) => Ok(false),
            Value::Int(1) => Ok(true),
            _ => Err(malformed(self.event, "expected a boolean")),
        }
    }

    /// Render any scalar payload for display.
    fn display(&mut self) -> Result<String> {
        Ok(self.next()?.to_string())
    }

    fn rest(self) -> Vec<Value> {
        self.items.collect()
    }
}

fn malformed(event: &str, reason: &str) -> Error {
    Error::Malformed {
        reason: format!("{event}: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn event(items: Vec<Value>) -> Result<Event> {
        Event::parse(Value::Array(items))
    }

    #[test]
    fn test_parses_call() {
        let parsed = event(vec![
            Value::Str("call".into()),
            Value::Int(1_700_000_000_000_000),
            Value::Int(1),
            Value::Int(3),
            Value::Bool(false),
            Value::Int(7),
        ])
        .unwrap();

        assert_eq!(
            parsed,
            Event::Call {
                time: 1_700_000_000_000_000,
                tracer: 1,
                mid: 3,
                singleton: false,
                klass: 7,
            }
        );
    }

    #[test]
    fn test_ccall_and_creturn_share_shapes() {
        let call = event(vec![
            Value::Str("ccall".into()),
            Value::Int(10),
            Value::Int(2),
            Value::Int(9),
            Value::Int(1),
            Value::Int(7),
        ])
        .unwrap();
        assert!(matches!(call, Event::Call { singleton: true, .. }));

        let ret = event(vec![
            Value::Str("creturn".into()),
            Value::Int(20),
            Value::Int(2),
        ])
        .unwrap();
        assert_eq!(ret, Event::Return { time: 20, tracer: 2 });
    }

    #[test]
    fn test_unknown_event_is_preserved() {
        let parsed = event(vec![
            Value::Str("telemetry".into()),
            Value::Int(1),
            Value::Str("x".into()),
        ])
        .unwrap();

        assert_eq!(
            parsed,
            Event::Unknown {
                name: "telemetry".into(),
                args: vec![Value::Int(1), Value::Str("x".into())],
            }
        );
    }

    #[test]
    fn test_known_event_with_bad_payload_is_malformed() {
        let err = event(vec![Value::Str("mid".into()), Value::Str("gsub".into())]).unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));

        let err = event(vec![Value::Str("gc_start".into())]).unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[test]
    fn test_non_array_body_is_malformed() {
        let err = Event::parse(Value::Str("call".into())).unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[test]
    fn test_eval_reply_renders_any_scalar() {
        let parsed = event(vec![Value::Str("evaled".into()), Value::Int(42)]).unwrap();
        assert_eq!(parsed, Event::Evaled { result: "42".into() });

        let parsed = event(vec![Value::Str("evaled".into()), Value::Nil]).unwrap();
        assert_eq!(parsed, Event::Evaled { result: "nil".into() });
    }
}
