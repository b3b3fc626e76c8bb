use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fuzzpatch::{apply_patch, ApplyOptions, PatchEvents};
use indoc::indoc;

// --- Parsing Benchmarks ---

fn parsing_benches(c: &mut Criterion) {
    let mut group = c.benchmark_group("Parsing");

    let simple_patch = indoc! {"
        --- a/src/main.rs
        +++ b/src/main.rs
        @@ -1,3 +1,3 @@
         fn main() {
        -    println!(\"Hello, world!\");
        +    println!(\"Hello, fuzzpatch!\");
         }
    "};
    group.bench_function("simple_patch", |b| {
        b.iter(|| {
            let events: Result<Vec<_>, _> = PatchEvents::new(black_box(simple_patch)).collect();
            events.unwrap()
        })
    });

    // One file, many hunks, to exercise the body parser
    let mut many_hunks = String::from("--- a/large_file.txt\n+++ b/large_file.txt\n");
    for i in 0..100 {
        many_hunks.push_str(&format!(
            "@@ -{0},2 +{0},2 @@\n context line {1}\n-old line {1}\n+new line {1}\n",
            i * 5 + 1,
            i
        ));
    }
    group.bench_function("patch_with_100_hunks", |b| {
        b.iter(|| {
            let events: Result<Vec<_>, _> = PatchEvents::new(black_box(&many_hunks)).collect();
            events.unwrap()
        })
    });

    // A long mail preamble before the diff, to measure scanning speed
    let mut mail_patch = "Lorem ipsum dolor sit amet...\n".repeat(1000);
    mail_patch.push_str(simple_patch);
    group.bench_function("long_preamble_scan", |b| {
        b.iter(|| {
            let events: Result<Vec<_>, _> = PatchEvents::new(black_box(&mail_patch)).collect();
            events.unwrap()
        })
    });

    group.finish();
}

// --- Applying Benchmarks ---

fn applying_benches(c: &mut Criterion) {
    let mut group = c.benchmark_group("Applying");
    let options = ApplyOptions::default();

    let mut large_content = String::new();
    for i in 0..10_000 {
        large_content.push_str(&format!("This is line number {}\n", i));
    }
    let large_patch = indoc! {"
        --- a/large_file.txt
        +++ b/large_file.txt
        @@ -5000,5 +5000,5 @@
         This is line number 4999
         This is line number 5000
        -This is line number 5001
        +THIS LINE WAS CHANGED
         This is line number 5002
         This is line number 5003
    "};

    group.bench_function("exact_match_large_file", |b| {
        b.iter(|| {
            apply_patch(
                black_box(large_patch),
                black_box(&large_content),
                &options,
            )
            .unwrap()
        })
    });

    // Prepend a few lines so the exact position misses and the candidate
    // search has to run.
    let displaced_content = format!("extra\nextra\nextra\n{large_content}");
    group.bench_function("offset_match_large_file", |b| {
        b.iter(|| {
            apply_patch(
                black_box(large_patch),
                black_box(&displaced_content),
                &options,
            )
            .unwrap()
        })
    });

    // Worst case: every line is a candidate and none of them matches, so the
    // search walks all fuzz levels before rejecting.
    let repetitive_content = "println!(\"hello world\");\n".repeat(10_000);
    let hopeless_patch = indoc! {"
        --- a/repetitive.txt
        +++ b/repetitive.txt
        @@ -5000,4 +5000,4 @@
         println!(\"hello world\");
        -a unique line to be removed
        +a unique line to be added
         println!(\"hello world\");
         println!(\"hello world\");
    "};
    group.bench_function("reject_after_full_search", |b| {
        b.iter(|| {
            apply_patch(
                black_box(hopeless_patch),
                black_box(&repetitive_content),
                &options,
            )
            .unwrap()
        })
    });

    group.finish();
}

criterion_group!(benches, parsing_benches, applying_benches);
criterion_main!(benches);
