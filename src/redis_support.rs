//! Small helpers shared by the broker and scaling service for reading a
//! stream's true backlog from Redis Streams, and for picking apart the flat
//! `[key, value, key, value, ...]` replies `XINFO`-style commands return
//! under RESP2.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// `XLEN` counts every entry ever `XADD`'d to a stream; nothing trims or
/// deletes entries as they're consumed (`XACK` only removes them from a
/// consumer group's pending-entries list, not the stream itself), so it
/// only ever grows. The real backlog for `group` on `stream` is the number
/// of entries not yet delivered to any consumer (`lag`) plus the number
/// delivered but not yet acknowledged (`pending`), both reported by
/// `XINFO GROUPS` — the Rust equivalent of the original's
/// `QueueMetricsService.get_true_queue_depth`.
///
/// Falls back to `XLEN` if `group` doesn't exist yet (nothing has ever
/// consumed from this stream, so the whole stream length *is* the
/// backlog), and to `0` if the stream itself doesn't exist.
pub(crate) async fn true_stream_depth(
    conn: &mut ConnectionManager,
    stream: &str,
    group: &str,
) -> redis::RedisResult<usize> {
    let groups_reply: redis::Value = match redis::cmd("XINFO")
        .arg("GROUPS")
        .arg(stream)
        .query_async(conn)
        .await
    {
        Ok(reply) => reply,
        Err(e) if e.to_string().to_lowercase().contains("no such key") => return Ok(0),
        Err(e) => return Err(e),
    };

    let Some(fields) = find_group_fields(&groups_reply, group) else {
        let len: u64 = conn.xlen(stream).await.unwrap_or(0);
        return Ok(len as usize);
    };

    let pending = field_i64(&fields, "pending").unwrap_or(0).max(0) as usize;
    // `lag` is Redis 7+ only and can be nil if it can't be determined (e.g.
    // entries were `XDEL`'d after being read); treat unknown lag as 0
    // rather than failing the whole depth read.
    let lag = field_i64(&fields, "lag").unwrap_or(0).max(0) as usize;

    Ok(pending + lag)
}

/// Finds the flattened field list for the group named `group` in an
/// `XINFO GROUPS` reply.
pub(crate) fn find_group_fields(
    groups_reply: &redis::Value,
    group: &str,
) -> Option<Vec<(String, redis::Value)>> {
    let redis::Value::Bulk(groups) = groups_reply else {
        return None;
    };
    groups
        .iter()
        .map(flatten_redis_map)
        .find(|fields| field_str(fields, "name").as_deref() == Some(group))
}

/// Pairs up a RESP2 flat `[key, value, key, value, ...]` array.
pub(crate) fn flatten_redis_map(value: &redis::Value) -> Vec<(String, redis::Value)> {
    let redis::Value::Bulk(items) = value else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(items.len() / 2);
    let mut iter = items.iter();
    while let (Some(key), Some(val)) = (iter.next(), iter.next()) {
        if let Some(key) = value_as_string(key) {
            out.push((key, val.clone()));
        }
    }
    out
}

pub(crate) fn field_str(fields: &[(String, redis::Value)], key: &str) -> Option<String> {
    fields.iter().find(|(k, _)| k == key).and_then(|(_, v)| value_as_string(v))
}

pub(crate) fn field_i64(fields: &[(String, redis::Value)], key: &str) -> Option<i64> {
    fields.iter().find(|(k, _)| k == key).and_then(|(_, v)| value_as_i64(v))
}

pub(crate) fn value_as_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(bytes) => String::from_utf8(bytes.clone()).ok(),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

pub(crate) fn value_as_i64(value: &redis::Value) -> Option<i64> {
    match value {
        redis::Value::Int(i) => Some(*i),
        redis::Value::Data(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_str(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    fn xinfo_groups_reply(groups: Vec<Vec<(&str, redis::Value)>>) -> redis::Value {
        redis::Value::Bulk(
            groups
                .into_iter()
                .map(|fields| {
                    redis::Value::Bulk(fields.into_iter().flat_map(|(k, v)| [bulk_str(k), v]).collect())
                })
                .collect(),
        )
    }

    #[test]
    fn find_group_fields_locates_group_by_name() {
        let reply = xinfo_groups_reply(vec![
            vec![("name", bulk_str("browser")), ("pending", redis::Value::Int(2))],
            vec![("name", bulk_str("tankpit")), ("pending", redis::Value::Int(9))],
        ]);

        let fields = find_group_fields(&reply, "tankpit").unwrap();
        assert_eq!(field_i64(&fields, "pending"), Some(9));
        assert!(find_group_fields(&reply, "ghost").is_none());
    }

    #[test]
    fn field_i64_reads_pending_and_lag() {
        let fields = vec![
            ("pending".to_string(), redis::Value::Int(3)),
            ("lag".to_string(), redis::Value::Int(7)),
        ];
        assert_eq!(field_i64(&fields, "pending"), Some(3));
        assert_eq!(field_i64(&fields, "lag"), Some(7));
        assert_eq!(field_i64(&fields, "missing"), None);
    }

    #[test]
    fn field_i64_missing_lag_is_none_not_zero() {
        // Redis <7 omits `lag` entirely rather than sending nil; callers
        // are responsible for defaulting it to 0.
        let fields = vec![("pending".to_string(), redis::Value::Int(1))];
        assert_eq!(field_i64(&fields, "lag"), None);
    }

    #[test]
    fn value_as_i64_parses_both_int_and_data_encodings() {
        assert_eq!(value_as_i64(&redis::Value::Int(42)), Some(42));
        assert_eq!(value_as_i64(&bulk_str("42")), Some(42));
        assert_eq!(value_as_i64(&bulk_str("not-a-number")), None);
    }
}
