use criterion::{black_box, criterion_group, criterion_main, Criterion};
use malang_vm::{compile, interpreter, SharedOutput, Vm};

fn bench_fib(c: &mut Criterion) {
    let source = "
        fn fib(n: int) -> int {
            if n < 2 { return n }
            return fib(n - 1) + fib(n - 2)
        }
        println(fib(18))
    ";
    let program = compile(source, "<bench>").expect("bench program compiles");
    c.bench_function("fib_18", |b| {
        b.iter(|| {
            let mut vm = Vm::with_output(
                program.clone(),
                Box::new(SharedOutput::new()),
            );
            black_box(interpreter::run(&mut vm).expect("bench program runs"));
        })
    });
}

fn bench_allocation_churn(c: &mut Criterion) {
    let source = "
        class Node { value : int next : Node }
        i := 0
        while i < 20000 {
            n := Node()
            n.value = i
            i = i + 1
        }
    ";
    let program = compile(source, "<bench>").expect("bench program compiles");
    c.bench_function("alloc_20k", |b| {
        b.iter(|| {
            let mut vm = Vm::with_output(
                program.clone(),
                Box::new(SharedOutput::new()),
            );
            black_box(interpreter::run(&mut vm).expect("bench program runs"));
        })
    });
}

criterion_group!(benches, bench_fib, bench_allocation_churn);
criterion_main!(benches);
