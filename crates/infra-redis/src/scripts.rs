// Lua scripts for atomic job transitions
//
// Every script takes ARGV[1] = key prefix, ARGV[2] = completed-job TTL
// (seconds), ARGV[3] = completed-set cap; script arguments start at ARGV[4].
//
// Keys:
//   {prefix}:job:{id}             hash, one per job
//   {prefix}:{queue}:dedup        hash, dedup_key -> job id
//   {prefix}:{queue}:waiting      zset, pending/retry_pending by scheduled_for
//   {prefix}:{queue}:active       zset, processing by expires_at
//   {prefix}:{queue}:completed    zset, by completed_at (capped, rows expire)
//   {prefix}:{queue}:failed       zset, by updated_at (kept)
//   {prefix}:{queue}:completions  hash, completions per asset and per
//                                 asset + job type (never expires)
//   {prefix}:user:{user_id}:jobs  set of job ids
//   {prefix}:queues               set of queue names
//
// Keys are derived inside the scripts, so they are not declared in KEYS.
// Redis Cluster needs every key in one slot: the prefix carries a `{...}`
// hash tag for that.

use redis::Script;

const PRELUDE: &str = r#"
local prefix = ARGV[1]
local completed_ttl = tonumber(ARGV[2])
local completed_cap = tonumber(ARGV[3])

local function job_key(id)
  return prefix .. ':job:' .. id
end

local function queue_key(queue, set)
  return prefix .. ':' .. queue .. ':' .. set
end

local function evict_completed(queue)
  local completed = queue_key(queue, 'completed')
  local excess = redis.call('ZCARD', completed) - completed_cap
  if excess <= 0 then
    return
  end
  local dedup = queue_key(queue, 'dedup')
  for _, old in ipairs(redis.call('ZRANGE', completed, 0, excess - 1)) do
    local old_key = job_key(old)
    local old_dedup = redis.call('HGET', old_key, 'dedup_key')
    if old_dedup and redis.call('HGET', dedup, old_dedup) == old then
      redis.call('HDEL', dedup, old_dedup)
    end
    redis.call('DEL', old_key)
    redis.call('ZREM', completed, old)
  end
end

-- Field of the completions hash; '\31' cannot appear in ids
local function completion_field(asset_id, job_type)
  if job_type then
    return asset_id .. '\31' .. job_type
  end
  return asset_id
end

-- Move the job into the state set matching its status
local function place(id)
  local key = job_key(id)
  local f = redis.call('HMGET', key, 'queue', 'status', 'scheduled_for',
    'expires_at', 'completed_at', 'updated_at', 'asset_id', 'job_type')
  local queue, status = f[1], f[2]
  local was_completed = redis.call('ZSCORE', queue_key(queue, 'completed'), id)
  for _, set in ipairs({ 'waiting', 'active', 'completed', 'failed' }) do
    redis.call('ZREM', queue_key(queue, set), id)
  end
  if status == 'completed' and not was_completed then
    local completions = queue_key(queue, 'completions')
    redis.call('HINCRBY', completions, completion_field(f[7], false), 1)
    if f[8] then
      redis.call('HINCRBY', completions, completion_field(f[7], f[8]), 1)
    end
  end
  if status == 'pending' or status == 'retry_pending' then
    redis.call('PERSIST', key)
    redis.call('ZADD', queue_key(queue, 'waiting'), f[3], id)
  elseif status == 'processing' then
    redis.call('PERSIST', key)
    redis.call('ZADD', queue_key(queue, 'active'), f[4] or f[6], id)
  elseif status == 'completed' then
    redis.call('ZADD', queue_key(queue, 'completed'), f[5] or f[6], id)
    redis.call('EXPIRE', key, completed_ttl)
    evict_completed(queue)
  else
    redis.call('PERSIST', key)
    redis.call('ZADD', queue_key(queue, 'failed'), f[6], id)
  end
end

-- Apply `n, field, value, ..., m, field, ...` starting at ARGV[i]
local function write_fields(key, i)
  local n = tonumber(ARGV[i])
  i = i + 1
  for _ = 1, n do
    redis.call('HSET', key, ARGV[i], ARGV[i + 1])
    i = i + 2
  end
  n = tonumber(ARGV[i])
  i = i + 1
  for _ = 1, n do
    redis.call('HDEL', key, ARGV[i])
    i = i + 1
  end
end
"#;

/// ARGV[4] queue, [5] dedup_key, [6] new id, [7..] fields of the new row.
/// Resetting an existing row keeps its id and created_at.
const UPSERT: &str = r#"
local queue, dedup_key, id = ARGV[4], ARGV[5], ARGV[6]
local dedup = queue_key(queue, 'dedup')
local existing = redis.call('HGET', dedup, dedup_key)
local created_at = false
if existing then
  created_at = redis.call('HGET', job_key(existing), 'created_at')
  if created_at then
    id = existing
  end
end

local key = job_key(id)
redis.call('DEL', key)
write_fields(key, 7)
redis.call('HSET', key, 'id', id)
if created_at then
  redis.call('HSET', key, 'created_at', created_at)
end

redis.call('HSET', dedup, dedup_key, id)
redis.call('SADD', prefix .. ':queues', queue)
redis.call('SADD', prefix .. ':user:' .. redis.call('HGET', key, 'user_id') .. ':jobs', id)
place(id)
return redis.call('HGETALL', key)
"#;

/// ARGV[4] queue, [5] now, [6] worker, [7] expires_at, [8] lease-expired details.
///
/// Candidates: due waiting jobs and processing jobs whose lease expired with
/// attempts left; the oldest by (scheduled_for, created_at) wins.
const CLAIM: &str = r#"
local queue, now, worker = ARGV[4], ARGV[5], ARGV[6]
local waiting = queue_key(queue, 'waiting')
local active = queue_key(queue, 'active')

local best, best_scheduled, best_created, reclaim = nil, 0, 0, false
local function consider(id, is_reclaim)
  local f = redis.call('HMGET', job_key(id), 'scheduled_for', 'created_at',
    'retry_count', 'max_retries')
  if not f[1] then
    redis.call('ZREM', waiting, id)
    redis.call('ZREM', active, id)
    return
  end
  if is_reclaim and tonumber(f[3]) >= tonumber(f[4]) then
    return
  end
  local scheduled, created = tonumber(f[1]), tonumber(f[2])
  if best == nil or scheduled < best_scheduled
      or (scheduled == best_scheduled and created < best_created) then
    best, best_scheduled, best_created, reclaim = id, scheduled, created, is_reclaim
  end
end

for _, id in ipairs(redis.call('ZRANGEBYSCORE', waiting, '-inf', now, 'LIMIT', 0, 10)) do
  consider(id, false)
end
for _, id in ipairs(redis.call('ZRANGEBYSCORE', active, '-inf', '(' .. now, 'LIMIT', 0, 10)) do
  consider(id, true)
end
if best == nil then
  return nil
end

local key = job_key(best)
if reclaim then
  redis.call('HINCRBY', key, 'retry_count', 1)
  redis.call('HSET', key, 'error_details', ARGV[8])
end
redis.call('HSET', key, 'status', 'processing', 'locked_by', worker,
  'locked_at', now, 'expires_at', ARGV[7], 'updated_at', now)
place(best)
return redis.call('HGETALL', key)
"#;

/// ARGV[4] id, [5] lease owner ('' = any), [6] allowed statuses, comma
/// separated ('' = any), [7..] field writes. Returns the row or nil when a
/// guard fails.
const UPDATE: &str = r#"
local id, owner, allowed = ARGV[4], ARGV[5], ARGV[6]
local key = job_key(id)
if redis.call('EXISTS', key) == 0 then
  return nil
end
if owner ~= '' and redis.call('HGET', key, 'locked_by') ~= owner then
  return nil
end
if allowed ~= '' then
  local status = redis.call('HGET', key, 'status')
  local ok = false
  for s in string.gmatch(allowed, '[^,]+') do
    if s == status then
      ok = true
    end
  end
  if not ok then
    return nil
  end
end
write_fields(key, 7)
place(id)
return redis.call('HGETALL', key)
"#;

/// ARGV[4] queue, [5] now, [6] error message, [7] error details.
/// Returns ids of the jobs failed.
const EXPIRE: &str = r#"
local queue, now = ARGV[4], ARGV[5]
local active = queue_key(queue, 'active')
local failed = {}
for _, id in ipairs(redis.call('ZRANGEBYSCORE', active, '-inf', '(' .. now)) do
  local key = job_key(id)
  local f = redis.call('HMGET', key, 'status', 'retry_count', 'max_retries')
  if not f[1] then
    redis.call('ZREM', active, id)
  elseif f[1] == 'processing' and tonumber(f[2]) >= tonumber(f[3]) then
    redis.call('HSET', key, 'status', 'failed', 'error_message', ARGV[6],
      'error_details', ARGV[7], 'updated_at', now)
    redis.call('HDEL', key, 'locked_by', 'locked_at', 'expires_at')
    place(id)
    table.insert(failed, id)
  end
end
return failed
"#;

pub(crate) struct Scripts {
    pub upsert: Script,
    pub claim: Script,
    pub update: Script,
    pub expire: Script,
}

impl Scripts {
    pub fn load() -> Self {
        let with_prelude = |body: &str| Script::new(&format!("{}{}", PRELUDE, body));
        Self {
            upsert: with_prelude(UPSERT),
            claim: with_prelude(CLAIM),
            update: with_prelude(UPDATE),
            expire: with_prelude(EXPIRE),
        }
    }
}
