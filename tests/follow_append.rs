mod test_util;
use test_util::{append, sleep_ms, Tail};

#[test]
fn appended_bytes_are_emitted_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("f.log");
    std::fs::write(&p, b"").unwrap();
    let mut t = Tail::spawn(&["-f", p.to_str().unwrap()]);
    append(&p, b"hello\n");
    t.expect("hello\n");
    append(&p, b"world\n");
    t.expect("world\n");
}

#[test]
fn banner_switching_between_two_files() {
    let dir = tempfile::tempdir().unwrap();
    let pa = dir.path().join("a.log");
    let pb = dir.path().join("b.log");
    std::fs::write(&pa, b"").unwrap();
    std::fs::write(&pb, b"").unwrap();
    let a = pa.to_str().unwrap();
    let b = pb.to_str().unwrap();
    let mut t = Tail::spawn(&["-f", a, b]);

    append(&pa, b"hello\n");
    t.expect(&format!("==> {a} <==\nhello\n"));

    append(&pb, b"world\n");
    t.expect(&format!("\n==> {b} <==\nworld\n"));

    // back to the first file: exactly one fresh banner
    append(&pa, b"again\n");
    t.expect(&format!("\n==> {a} <==\nagain\n"));

    // same file again: no banner at all
    append(&pa, b"more\n");
    t.expect("more\n");
}

#[test]
fn quiet_follow_never_prints_banners() {
    let dir = tempfile::tempdir().unwrap();
    let pa = dir.path().join("a.log");
    let pb = dir.path().join("b.log");
    std::fs::write(&pa, b"").unwrap();
    std::fs::write(&pb, b"").unwrap();
    let mut t = Tail::spawn(&["-q", "-f", pa.to_str().unwrap(), pb.to_str().unwrap()]);
    append(&pa, b"x\n");
    t.expect("x\n");
    append(&pb, b"y\n");
    t.expect("y\n");
    append(&pa, b"z\n");
    t.expect("z\n");
}

#[test]
fn zero_count_follow_starts_at_end() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("f.log");
    std::fs::write(&p, b"old\n").unwrap();
    let mut t = Tail::spawn(&["-n", "0", "-f", p.to_str().unwrap()]);
    sleep_ms(500);
    append(&p, b"new\n");
    t.expect("new\n");
}

#[test]
fn seed_then_follow_single_file() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("f.log");
    std::fs::write(&p, b"1\n2\n3\n").unwrap();
    let mut t = Tail::spawn(&["-n", "2", "-f", p.to_str().unwrap()]);
    t.expect("2\n3\n");
    append(&p, b"4\n");
    t.expect("4\n");
}

#[test]
fn polling_backend_follows_appends_too() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("f.log");
    std::fs::write(&p, b"").unwrap();
    let mut t = Tail::spawn(&["-f", "--poll", "-s", "0.1", p.to_str().unwrap()]);
    append(&p, b"tick\n");
    t.expect("tick\n");
    append(&p, b"tock\n");
    t.expect("tock\n");
}
