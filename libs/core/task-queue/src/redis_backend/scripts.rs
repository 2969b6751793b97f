//! Lua scripts for the multi-key operations that must be atomic.

use once_cell::sync::Lazy;
use redis::Script;

/// Insert or overwrite a task hash and index it.
///
/// KEYS: task hash, index of the record's status, every status index.
/// ARGV: task id, updated_at ms, ttl secs, mode (`nx` | `replace`), field pairs...
pub(crate) static UPSERT_RECORD: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  if ARGV[4] == 'nx' then
    return 0
  end
  redis.call('DEL', KEYS[1])
end
for i = 5, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('EXPIRE', KEYS[1], ARGV[3])
for i = 3, #KEYS do
  redis.call('ZREM', KEYS[i], ARGV[1])
end
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#,
    )
});

/// Guarded status write. Returns the updated hash, or nil when the record is
/// missing or the guard does not match.
///
/// KEYS: task hash, index of the new status, every status index.
/// ARGV: task id, allowed statuses (csv, empty = any), updated_before ms
/// (empty = none), new status, now ms, ttl secs, holder worker id (empty =
/// any), number of field pairs, field pairs..., fields to delete...
pub(crate) static TRANSITION: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
  return false
end
if ARGV[2] ~= '' then
  local allowed = false
  for status in string.gmatch(ARGV[2], '[^,]+') do
    if status == current then
      allowed = true
    end
  end
  if not allowed then
    return false
  end
end
if ARGV[3] ~= '' then
  local updated = tonumber(redis.call('HGET', KEYS[1], 'updated_at') or '0')
  if updated > tonumber(ARGV[3]) then
    return false
  end
end
if ARGV[7] ~= '' and redis.call('HGET', KEYS[1], 'worker_id') ~= ARGV[7] then
  return false
end
local pairs_end = 9 + 2 * tonumber(ARGV[8])
for i = 9, pairs_end - 1, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
for i = pairs_end, #ARGV do
  redis.call('HDEL', KEYS[1], ARGV[i])
end
redis.call('HSET', KEYS[1], 'status', ARGV[4], 'updated_at', ARGV[5])
redis.call('EXPIRE', KEYS[1], ARGV[6])
for i = 3, #KEYS do
  redis.call('ZREM', KEYS[i], ARGV[1])
end
redis.call('ZADD', KEYS[2], ARGV[5], ARGV[1])
return redis.call('HGETALL', KEYS[1])
"#,
    )
});

/// Bounded retry increment. Returns `{1, count}` when bumped, `{0, count}`
/// when the budget is spent, nil when the record is missing.
pub(crate) static INCREMENT_RETRY: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local fields = redis.call('HMGET', KEYS[1], 'retry_count', 'max_retries')
if not fields[1] then
  return false
end
local count = tonumber(fields[1])
local max = tonumber(fields[2] or '0')
if count >= max then
  return {0, count}
end
return {1, redis.call('HINCRBY', KEYS[1], 'retry_count', 1)}
"#,
    )
});

/// Heartbeat: refresh `updated_at` of a processing record.
///
/// KEYS: task hash, processing index. ARGV: task id, now ms, ttl secs.
pub(crate) static TOUCH: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
if redis.call('HGET', KEYS[1], 'status') ~= 'processing' then
  return 0
end
redis.call('HSET', KEYS[1], 'updated_at', ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[3])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
return 1
"#,
    )
});

/// Guarded delete. Index entries are dropped even when the hash already
/// expired.
///
/// KEYS: task hash, every status index.
/// ARGV: task id, allowed statuses (csv), updated_before ms, holder worker
/// id (empty = any).
pub(crate) static REMOVE_RECORD: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local current = redis.call('HGET', KEYS[1], 'status')
local matched = current ~= false
if matched and ARGV[2] ~= '' then
  matched = false
  for status in string.gmatch(ARGV[2], '[^,]+') do
    if status == current then
      matched = true
    end
  end
end
if matched and ARGV[3] ~= '' then
  local updated = tonumber(redis.call('HGET', KEYS[1], 'updated_at') or '0')
  matched = updated <= tonumber(ARGV[3])
end
if matched and ARGV[4] ~= '' then
  matched = redis.call('HGET', KEYS[1], 'worker_id') == ARGV[4]
end
if current and not matched then
  return 0
end
for i = 2, #KEYS do
  redis.call('ZREM', KEYS[i], ARGV[1])
end
if current then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
"#,
    )
});

/// Move due members of the delayed set onto their lanes.
///
/// KEYS: delayed set, priority lane, normal lane.
/// ARGV: now ms, priority threshold, limit.
pub(crate) static PROMOTE_DUE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[3])
for _, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  local id, priority = string.match(member, '^(.*)|(-?%d+)$')
  if id then
    if tonumber(priority) >= tonumber(ARGV[2]) then
      redis.call('RPUSH', KEYS[2], id)
    else
      redis.call('RPUSH', KEYS[3], id)
    end
  end
end
return due
"#,
    )
});

/// Pop the head id, priority lane first, and mark it in flight.
///
/// KEYS: priority lane, normal lane, in-flight set. ARGV: now ms.
pub(crate) static POP_IN_FLIGHT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
for i = 1, 2 do
  local id = redis.call('LPOP', KEYS[i])
  if id then
    redis.call('ZADD', KEYS[3], ARGV[1], id)
    return id
  end
end
return false
"#,
    )
});
