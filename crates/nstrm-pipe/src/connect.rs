//! Connectors: wire one stage's output into a fresh input of another.
//!
//! Wiring happens immediately, before either stage runs. The composite that
//! comes back starts the left stage before the right one.

use std::sync::Arc;

use uuid::Uuid;

use crate::pipe::{Composite, Handle, Pipe, Role};
use crate::refcount::Ref;
use crate::stage::Payload;
use crate::{PipeError, Result};

fn compose<T: Payload>(role: Role, left: &Pipe<T>, right: &Pipe<T>) -> Handle<T> {
    let composite = Composite {
        id: Uuid::new_v4(),
        role,
        left: left.clone(),
        right: right.clone(),
        refs: Ref::new(),
    };
    tracing::debug!(
        stage = %composite.id,
        left = %left.role(),
        right = %right.role(),
        role = %role,
        "Connected"
    );
    Handle::new(Pipe::Composite(Arc::new(composite)))
}

fn require<T: Payload>(pipe: &Pipe<T>, side: &'static str, wanted: Role) -> Result<()> {
    let role = pipe.role();
    let ok = match wanted {
        Role::Producer => role.emits(),
        Role::Filter => role.emits() && role.accepts(),
        Role::Consumer => role.accepts() && role.resolves(),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(PipeError::Mismatch {
            side,
            wanted,
            found: role,
        })
    }
}

fn wire<T: Payload>(left: &Pipe<T>, right: &Pipe<T>) -> Result<()> {
    left.add_sink(right.new_source()?)
}

/// Producer + Consumer → Terminal.
pub fn connect_pc<T: Payload>(producer: &Pipe<T>, consumer: &Pipe<T>) -> Result<Handle<T>> {
    require(producer, "left", Role::Producer)?;
    require(consumer, "right", Role::Consumer)?;
    wire(producer, consumer)?;
    Ok(compose(Role::Terminal, producer, consumer))
}

/// Producer + Filter → Producer.
pub fn connect_pf<T: Payload>(producer: &Pipe<T>, filter: &Pipe<T>) -> Result<Handle<T>> {
    require(producer, "left", Role::Producer)?;
    require(filter, "right", Role::Filter)?;
    wire(producer, filter)?;
    Ok(compose(Role::Producer, producer, filter))
}

/// Filter + Consumer → Consumer.
pub fn connect_fc<T: Payload>(filter: &Pipe<T>, consumer: &Pipe<T>) -> Result<Handle<T>> {
    require(filter, "left", Role::Filter)?;
    require(consumer, "right", Role::Consumer)?;
    wire(filter, consumer)?;
    Ok(compose(Role::Consumer, filter, consumer))
}

/// Filter + Filter → Filter.
pub fn connect_ff<T: Payload>(first: &Pipe<T>, second: &Pipe<T>) -> Result<Handle<T>> {
    require(first, "left", Role::Filter)?;
    require(second, "right", Role::Filter)?;
    wire(first, second)?;
    Ok(compose(Role::Filter, first, second))
}

/// Join a consumer (inbound side) and a producer (outbound side) into one
/// bidirectional endpoint. Nothing is wired between the two.
pub fn in_out<T: Payload>(consumer: &Pipe<T>, producer: &Pipe<T>) -> Result<Handle<T>> {
    require(consumer, "left", Role::Consumer)?;
    require(producer, "right", Role::Producer)?;
    Ok(compose(Role::Port, consumer, producer))
}

/// Pick the connector for a pair of stages by their capabilities. A left
/// side that both emits and accepts is treated as a filter.
pub fn connect<T: Payload>(left: &Pipe<T>, right: &Pipe<T>) -> Result<Handle<T>> {
    let (l, r) = (left.role(), right.role());
    let right_filter = r.emits() && r.accepts();
    let right_consumer = r.accepts() && r.resolves();
    match (l.emits(), l.accepts()) {
        (true, true) if right_filter => connect_ff(left, right),
        (true, true) if right_consumer => connect_fc(left, right),
        (true, false) if right_filter => connect_pf(left, right),
        (true, false) if right_consumer => connect_pc(left, right),
        _ => Err(PipeError::Incompatible { left: l, right: r }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Consumer, Filter, Producer, Valve};
    use tokio::sync::mpsc;

    fn passthrough() -> Handle<i64> {
        Filter::new(|mut rx: mpsc::Receiver<i64>, out: Valve<i64>| async move {
            while let Some(v) = rx.recv().await {
                if !out.send(v).await {
                    break;
                }
            }
        })
    }

    fn counter() -> Handle<i64> {
        Consumer::new(|mut rx: mpsc::Receiver<i64>| async move {
            let mut n = 0;
            while rx.recv().await.is_some() {
                n += 1;
            }
            n
        })
    }

    #[tokio::test]
    async fn composite_roles() {
        let p = Producer::new(Valve::new());
        let f = passthrough();
        let c = counter();

        assert_eq!(connect_pf(&p, &f).unwrap().role(), Role::Producer);
        assert_eq!(connect_ff(&passthrough(), &passthrough()).unwrap().role(), Role::Filter);
        assert_eq!(connect_fc(&passthrough(), &c).unwrap().role(), Role::Consumer);
        assert_eq!(
            connect_pc(&Producer::new(Valve::new()), &counter()).unwrap().role(),
            Role::Terminal
        );
        assert_eq!(
            in_out(&counter(), &Producer::new(Valve::new())).unwrap().role(),
            Role::Port
        );
    }

    #[tokio::test]
    async fn generic_connect_prefers_filter_reading() {
        let hub = crate::Hub::new();
        let joined = connect(&hub, &counter()).unwrap();
        assert_eq!(joined.role(), Role::Consumer);

        let joined = connect(&Producer::new(Valve::new()), &passthrough()).unwrap();
        assert_eq!(joined.role(), Role::Producer);
    }

    #[tokio::test]
    async fn mismatched_roles_are_rejected() {
        let err = connect_pc(&counter(), &counter()).unwrap_err();
        assert!(matches!(
            err,
            PipeError::Mismatch {
                side: "left",
                wanted: Role::Producer,
                found: Role::Consumer
            }
        ));

        let terminal = connect_pc(&Producer::new(Valve::new()), &counter()).unwrap();
        assert!(matches!(
            connect(&terminal, &counter()).unwrap_err(),
            PipeError::Incompatible { .. }
        ));
    }
}
