//! Command dispatch over the keyspace.
//!
//! Handlers short-circuit with a `Reject` on any per-request error; the
//! dispatcher serializes it as an in-band `ERR` value, so the connection
//! keeps running. Command names are matched case-insensitively with exact
//! arity; anything else is `UNKNOWN`.

use crate::buf::Buffer;
use crate::db::{Db, Entry, Value};
use crate::protocol::{
    out_arr, out_begin_arr, out_dbl, out_end_arr, out_err, out_int, out_nil, out_str, ErrCode,
};
use crate::zset::ZSet;

struct Reject {
    code: ErrCode,
    msg: &'static str,
}

impl Reject {
    fn unknown() -> Self {
        Self {
            code: ErrCode::Unknown,
            msg: "unknown command",
        }
    }

    fn bad_type(msg: &'static str) -> Self {
        Self {
            code: ErrCode::BadType,
            msg,
        }
    }

    fn bad_arg(msg: &'static str) -> Self {
        Self {
            code: ErrCode::BadArg,
            msg,
        }
    }
}

type CmdResult = Result<(), Reject>;

pub fn dispatch(db: &mut Db, args: &[Vec<u8>], out: &mut Buffer, now_ms: u64) {
    let result = match args.split_first() {
        None => Err(Reject::unknown()),
        Some((name, rest)) => match (name.to_ascii_lowercase().as_slice(), rest) {
            (b"get", [key]) => do_get(db, key, out),
            (b"set", [key, val]) => do_set(db, key, val, out),
            (b"del", [key]) => do_del(db, key, out),
            (b"keys", []) => do_keys(db, out),
            (b"zadd", [key, score, member]) => do_zadd(db, key, score, member, out),
            (b"zrem", [key, member]) => do_zrem(db, key, member, out),
            (b"zscore", [key, member]) => do_zscore(db, key, member, out),
            (b"zquery", [key, score, member, offset, limit]) => {
                do_zquery(db, key, score, member, offset, limit, out)
            }
            (b"pexpire", [key, ttl]) => do_pexpire(db, key, ttl, out, now_ms),
            (b"pttl", [key]) => do_pttl(db, key, out, now_ms),
            _ => Err(Reject::unknown()),
        },
    };
    if let Err(reject) = result {
        out_err(out, reject.code, reject.msg);
    }
}

fn parse_float(arg: &[u8]) -> Result<f64, Reject> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| !v.is_nan())
        .ok_or_else(|| Reject::bad_arg("expect floating point number"))
}

fn parse_int(arg: &[u8]) -> Result<i64, Reject> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Reject::bad_arg("expect integer"))
}

fn do_get(db: &Db, key: &[u8], out: &mut Buffer) -> CmdResult {
    match db.get(key).map(|e| &e.value) {
        None => out_nil(out),
        Some(Value::Str(val)) => out_str(out, val),
        Some(Value::ZSet(_)) => return Err(Reject::bad_type("expect string")),
    }
    Ok(())
}

fn do_set(db: &mut Db, key: &[u8], val: &[u8], out: &mut Buffer) -> CmdResult {
    match db.get_mut(key).map(|e| &mut e.value) {
        Some(Value::Str(cur)) => {
            *cur = val.to_vec();
            out_nil(out);
            return Ok(());
        }
        Some(Value::ZSet(_)) => return Err(Reject::bad_type("expect string")),
        None => {}
    }
    db.insert(Entry::new(key.to_vec(), Value::Str(val.to_vec())));
    out_nil(out);
    Ok(())
}

fn do_del(db: &mut Db, key: &[u8], out: &mut Buffer) -> CmdResult {
    out_int(out, db.remove(key) as i64);
    Ok(())
}

fn do_keys(db: &Db, out: &mut Buffer) -> CmdResult {
    out_arr(out, db.len() as u32);
    for key in db.keys() {
        out_str(out, key);
    }
    Ok(())
}

fn do_zadd(db: &mut Db, key: &[u8], score: &[u8], member: &[u8], out: &mut Buffer) -> CmdResult {
    let score = parse_float(score)?;
    match db.get_mut(key).map(|e| &mut e.value) {
        Some(Value::ZSet(zset)) => {
            out_int(out, zset.insert(member, score) as i64);
            return Ok(());
        }
        Some(Value::Str(_)) => return Err(Reject::bad_type("expect zset")),
        None => {}
    }
    // only zadd creates on miss
    let mut zset = ZSet::new();
    let added = zset.insert(member, score);
    db.insert(Entry::new(key.to_vec(), Value::ZSet(zset)));
    out_int(out, added as i64);
    Ok(())
}

fn do_zrem(db: &mut Db, key: &[u8], member: &[u8], out: &mut Buffer) -> CmdResult {
    let removed = match db.get_mut(key).map(|e| &mut e.value) {
        // a missing key reads as an empty set
        None => false,
        Some(Value::ZSet(zset)) => zset.remove(member),
        Some(Value::Str(_)) => return Err(Reject::bad_type("expect zset")),
    };
    out_int(out, removed as i64);
    Ok(())
}

fn do_zscore(db: &Db, key: &[u8], member: &[u8], out: &mut Buffer) -> CmdResult {
    match db.get(key).map(|e| &e.value) {
        None => out_nil(out),
        Some(Value::ZSet(zset)) => match zset.lookup(member) {
            Some(handle) => out_dbl(out, zset.score(handle)),
            None => out_nil(out),
        },
        Some(Value::Str(_)) => return Err(Reject::bad_type("expect zset")),
    }
    Ok(())
}

fn do_zquery(
    db: &Db,
    key: &[u8],
    score: &[u8],
    member: &[u8],
    offset: &[u8],
    limit: &[u8],
    out: &mut Buffer,
) -> CmdResult {
    let score = parse_float(score)?;
    let offset = parse_int(offset)?;
    let limit = parse_int(limit)?;

    let zset = match db.get(key).map(|e| &e.value) {
        // a missing key reads as an empty set
        None => {
            out_arr(out, 0);
            return Ok(());
        }
        Some(Value::ZSet(zset)) => zset,
        Some(Value::Str(_)) => return Err(Reject::bad_type("expect zset")),
    };
    if limit <= 0 {
        out_arr(out, 0);
        return Ok(());
    }

    let mut node = zset
        .seekge(score, member)
        .and_then(|h| zset.offset(h, offset));
    let ctx = out_begin_arr(out);
    let mut n: i64 = 0;
    while let Some(handle) = node {
        if n + 2 > limit {
            break;
        }
        out_str(out, zset.name(handle));
        out_dbl(out, zset.score(handle));
        n += 2;
        node = zset.offset(handle, 1);
    }
    out_end_arr(out, ctx, n as u32);
    Ok(())
}

fn do_pexpire(db: &mut Db, key: &[u8], ttl: &[u8], out: &mut Buffer, now_ms: u64) -> CmdResult {
    let ttl_ms = parse_int(ttl)?;
    out_int(out, db.set_ttl(key, ttl_ms, now_ms) as i64);
    Ok(())
}

fn do_pttl(db: &Db, key: &[u8], out: &mut Buffer, now_ms: u64) -> CmdResult {
    match db.get(key) {
        None => out_int(out, -2),
        Some(entry) => match db.ttl_ms(entry, now_ms) {
            None => out_int(out, -1),
            Some(remaining) => out_int(out, remaining as i64),
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::testutil::{decode_response, Value as V};
    use crate::protocol::{response_begin, response_end};

    fn exec(db: &mut Db, args: &[&[u8]]) -> V {
        exec_at(db, args, 0)
    }

    fn exec_at(db: &mut Db, args: &[&[u8]], now_ms: u64) -> V {
        let args: Vec<Vec<u8>> = args.iter().map(|a| a.to_vec()).collect();
        let mut out = Buffer::new();
        let header = response_begin(&mut out);
        dispatch(db, &args, &mut out, now_ms);
        response_end(&mut out, header);
        decode_response(out.data()).0
    }

    fn pairs(value: V) -> Vec<(String, f64)> {
        let V::Arr(items) = value else {
            panic!("expected array, got {value:?}");
        };
        items
            .chunks(2)
            .map(|pair| match pair {
                [V::Str(name), V::Dbl(score)] => {
                    (String::from_utf8(name.clone()).unwrap(), *score)
                }
                other => panic!("expected name/score pair, got {other:?}"),
            })
            .collect()
    }

    #[test]
    fn get_set_del_roundtrip() {
        let mut db = Db::new();
        assert_eq!(exec(&mut db, &[b"set", b"foo", b"bar"]), V::Nil);
        assert_eq!(exec(&mut db, &[b"get", b"foo"]), V::Str(b"bar".to_vec()));
        assert_eq!(exec(&mut db, &[b"del", b"foo"]), V::Int(1));
        assert_eq!(exec(&mut db, &[b"get", b"foo"]), V::Nil);
        assert_eq!(exec(&mut db, &[b"del", b"foo"]), V::Int(0));
    }

    #[test]
    fn set_overwrites_idempotently() {
        let mut db = Db::new();
        exec(&mut db, &[b"set", b"k", b"v"]);
        exec(&mut db, &[b"set", b"k", b"v"]);
        assert_eq!(exec(&mut db, &[b"get", b"k"]), V::Str(b"v".to_vec()));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn keys_lists_everything() {
        let mut db = Db::new();
        exec(&mut db, &[b"set", b"a", b"1"]);
        exec(&mut db, &[b"zadd", b"z", b"1", b"m"]);
        let V::Arr(items) = exec(&mut db, &[b"keys"]) else {
            panic!()
        };
        let mut keys: Vec<Vec<u8>> = items
            .into_iter()
            .map(|v| match v {
                V::Str(s) => s,
                other => panic!("expected string key, got {other:?}"),
            })
            .collect();
        keys.sort();
        assert_eq!(keys, vec![b"a".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn unknown_command_and_wrong_arity() {
        let mut db = Db::new();
        let V::Err(code, _) = exec(&mut db, &[b"frobnicate"]) else {
            panic!()
        };
        assert_eq!(code, ErrCode::Unknown as u32);
        let V::Err(code, _) = exec(&mut db, &[b"get", b"a", b"b"]) else {
            panic!()
        };
        assert_eq!(code, ErrCode::Unknown as u32);
    }

    #[test]
    fn command_names_are_case_insensitive() {
        let mut db = Db::new();
        assert_eq!(exec(&mut db, &[b"SET", b"k", b"v"]), V::Nil);
        assert_eq!(exec(&mut db, &[b"GeT", b"k"]), V::Str(b"v".to_vec()));
    }

    #[test]
    fn type_mismatch_is_reported_in_band() {
        let mut db = Db::new();
        exec(&mut db, &[b"set", b"x", b"1"]);
        let V::Err(code, msg) = exec(&mut db, &[b"zadd", b"x", b"1", b"a"]) else {
            panic!()
        };
        assert_eq!(code, ErrCode::BadType as u32);
        assert_eq!(msg, "expect zset");

        exec(&mut db, &[b"zadd", b"z", b"1", b"a"]);
        let V::Err(code, _) = exec(&mut db, &[b"get", b"z"]) else {
            panic!()
        };
        assert_eq!(code, ErrCode::BadType as u32);
    }

    #[test]
    fn zadd_reports_new_vs_updated() {
        let mut db = Db::new();
        assert_eq!(exec(&mut db, &[b"zadd", b"s", b"1", b"a"]), V::Int(1));
        assert_eq!(exec(&mut db, &[b"zadd", b"s", b"2", b"b"]), V::Int(1));
        assert_eq!(exec(&mut db, &[b"zadd", b"s", b"1", b"a"]), V::Int(0));
        assert_eq!(exec(&mut db, &[b"zscore", b"s", b"a"]), V::Dbl(1.0));
    }

    #[test]
    fn zadd_rejects_bad_scores() {
        let mut db = Db::new();
        for bad in [&b"nan"[..], b"1.5x", b"", b"one"] {
            let V::Err(code, _) = exec(&mut db, &[b"zadd", b"s", bad, b"a"]) else {
                panic!("score {bad:?} accepted");
            };
            assert_eq!(code, ErrCode::BadArg as u32);
        }
        assert_eq!(exec(&mut db, &[b"get", b"s"]), V::Nil);
    }

    #[test]
    fn zscore_missing_cases() {
        let mut db = Db::new();
        assert_eq!(exec(&mut db, &[b"zscore", b"nokey", b"a"]), V::Nil);
        exec(&mut db, &[b"zadd", b"s", b"1", b"a"]);
        assert_eq!(exec(&mut db, &[b"zscore", b"s", b"nobody"]), V::Nil);
    }

    #[test]
    fn zrem_on_missing_key_or_member() {
        let mut db = Db::new();
        assert_eq!(exec(&mut db, &[b"zrem", b"nokey", b"a"]), V::Int(0));
        exec(&mut db, &[b"zadd", b"s", b"1", b"a"]);
        assert_eq!(exec(&mut db, &[b"zrem", b"s", b"b"]), V::Int(0));
        assert_eq!(exec(&mut db, &[b"zrem", b"s", b"a"]), V::Int(1));
        assert_eq!(exec(&mut db, &[b"zrem", b"s", b"a"]), V::Int(0));
    }

    #[test]
    fn zquery_range_and_offset() {
        let mut db = Db::new();
        exec(&mut db, &[b"zadd", b"s", b"1", b"a"]);
        exec(&mut db, &[b"zadd", b"s", b"2", b"b"]);

        let got = pairs(exec(&mut db, &[b"zquery", b"s", b"-inf", b"", b"0", b"10"]));
        assert_eq!(got, vec![("a".into(), 1.0), ("b".into(), 2.0)]);

        // skip one element >= (1, "a")
        let got = pairs(exec(&mut db, &[b"zquery", b"s", b"1", b"a", b"1", b"10"]));
        assert_eq!(got, vec![("b".into(), 2.0)]);

        // seek past the end
        let got = pairs(exec(&mut db, &[b"zquery", b"s", b"5", b"", b"0", b"10"]));
        assert!(got.is_empty());
    }

    #[test]
    fn zquery_limit_counts_elements() {
        let mut db = Db::new();
        for i in 0..10u32 {
            let member = format!("m{i}");
            let score = format!("{i}");
            exec(&mut db, &[b"zadd", b"s", score.as_bytes(), member.as_bytes()]);
        }
        let got = pairs(exec(&mut db, &[b"zquery", b"s", b"-inf", b"", b"0", b"6"]));
        assert_eq!(got.len(), 3);
        let got = pairs(exec(&mut db, &[b"zquery", b"s", b"-inf", b"", b"0", b"0"]));
        assert!(got.is_empty());
        let got = pairs(exec(&mut db, &[b"zquery", b"s", b"-inf", b"", b"0", b"-4"]));
        assert!(got.is_empty());
    }

    #[test]
    fn zquery_offset_off_either_end_is_empty() {
        let mut db = Db::new();
        exec(&mut db, &[b"zadd", b"s", b"1", b"a"]);
        let got = pairs(exec(&mut db, &[b"zquery", b"s", b"-inf", b"", b"99", b"10"]));
        assert!(got.is_empty());
        let got = pairs(exec(&mut db, &[b"zquery", b"s", b"-inf", b"", b"-99", b"10"]));
        assert!(got.is_empty());
    }

    #[test]
    fn zquery_missing_key_reads_as_empty() {
        let mut db = Db::new();
        let got = exec(&mut db, &[b"zquery", b"nokey", b"0", b"", b"0", b"10"]);
        assert_eq!(got, V::Arr(vec![]));
        // and the read must not create the key
        assert_eq!(db.len(), 0);
    }

    #[test]
    fn zquery_pagination_visits_each_member_once() {
        let mut db = Db::new();
        for i in 0..25u32 {
            let member = format!("m{i:02}");
            exec(&mut db, &[b"zadd", b"s", b"7", member.as_bytes()]);
        }
        let mut seen = Vec::new();
        let mut offset = 0usize;
        loop {
            let offset_arg = offset.to_string();
            let page = pairs(exec(
                &mut db,
                &[b"zquery", b"s", b"-inf", b"", offset_arg.as_bytes(), b"8"],
            ));
            if page.is_empty() {
                break;
            }
            offset += page.len();
            seen.extend(page);
        }
        assert_eq!(seen.len(), 25);
        let names: Vec<String> = seen.iter().map(|(n, _)| n.clone()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn pexpire_and_pttl() {
        let mut db = Db::new();
        assert_eq!(exec_at(&mut db, &[b"pttl", b"k"], 0), V::Int(-2));
        exec(&mut db, &[b"set", b"k", b"v"]);
        assert_eq!(exec_at(&mut db, &[b"pttl", b"k"], 0), V::Int(-1));

        assert_eq!(exec_at(&mut db, &[b"pexpire", b"k", b"500"], 1000), V::Int(1));
        assert_eq!(exec_at(&mut db, &[b"pttl", b"k"], 1200), V::Int(300));

        // clear the deadline again
        assert_eq!(exec_at(&mut db, &[b"pexpire", b"k", b"-1"], 1200), V::Int(1));
        assert_eq!(exec_at(&mut db, &[b"pttl", b"k"], 1200), V::Int(-1));

        assert_eq!(
            exec_at(&mut db, &[b"pexpire", b"missing", b"500"], 0),
            V::Int(0)
        );
        let V::Err(code, _) = exec(&mut db, &[b"pexpire", b"k", b"soon"]) else {
            panic!()
        };
        assert_eq!(code, ErrCode::BadArg as u32);
    }

    #[test]
    fn expired_key_is_gone_after_sweep() {
        let mut db = Db::new();
        exec(&mut db, &[b"set", b"k", b"v"]);
        exec_at(&mut db, &[b"pexpire", b"k", b"100"], 0);
        db.expire_keys(50);
        assert_eq!(exec(&mut db, &[b"get", b"k"]), V::Str(b"v".to_vec()));
        db.expire_keys(150);
        assert_eq!(exec(&mut db, &[b"get", b"k"]), V::Nil);
        assert_eq!(exec_at(&mut db, &[b"pttl", b"k"], 150), V::Int(-2));
    }
}
