//! Reference helpers over dynamic values. Only functions and stages are
//! counted; every other value passes through untouched.

use nstrm_pipe::Lease;

use crate::value::Value;

/// Whether `value` carries an interest counter.
pub fn counted(value: &Value) -> bool {
    value.refs().is_some()
}

/// Take a lease on `value` if it is counted. Dropping the lease is the
/// matching decrement.
pub fn incref_if(value: &Value) -> Option<Lease> {
    value.refs().map(|refs| refs.lease())
}

/// Wait until nobody holds `value` any more. Returns at once for values
/// that are not counted.
pub async fn wait_if(value: &Value) {
    if let Some(refs) = value.refs() {
        refs.wait().await;
    }
}

/// Whether two values are the same counted resource.
pub fn same_resource(a: &Value, b: &Value) -> bool {
    match (a.refs(), b.refs()) {
        (Some(x), Some(y)) => x.same(y),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Function;
    use std::time::Duration;

    #[tokio::test]
    async fn plain_values_are_not_counted() {
        let v = Value::int(3);
        assert!(!counted(&v));
        assert!(incref_if(&v).is_none());
        tokio::time::timeout(Duration::from_millis(50), wait_if(&v))
            .await
            .expect("plain values never block");
    }

    #[tokio::test]
    async fn wait_if_tracks_leases() {
        let f = Value::Function(Function::builtin("noop", |_| Ok(Value::Nil)));
        let weak = f.uncounted();
        let lease = incref_if(&f).expect("functions are counted");
        drop(f);

        let waiting = tokio::spawn(async move { wait_if(&weak).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());
        drop(lease);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("wait_if should return once the lease is gone")
            .unwrap();
    }

    #[tokio::test]
    async fn same_resource_ignores_plain_values() {
        let f = Value::Function(Function::builtin("noop", |_| Ok(Value::Nil)));
        assert!(same_resource(&f, &f.clone()));
        assert!(!same_resource(&Value::Nil, &Value::Nil));
    }
}
