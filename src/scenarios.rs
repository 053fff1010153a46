//! Example graphs behind `entangle run`.

use crate::cli::Scenario;
use anyhow::{Context, anyhow};
use entangle::{Arg, Invocation, SegmentHandle, Task, TaskOptions, TaskResult, Thunk, Value, json};
use std::time::Duration;

/// Build the graph for `scenario`. Every task gets `options`.
pub fn build(scenario: &Scenario, options: &TaskOptions) -> Thunk {
    match scenario {
        Scenario::Add => add(options),
        Scenario::FanOut { n } => fan_out(*n, options),
        Scenario::Branch { input } => branch(input, options),
        Scenario::Stall { stall_ms } => stall(*stall_ms, options),
    }
}

fn sum_ints(inv: &Invocation<'_>) -> TaskResult {
    let mut total = 0i64;
    for index in 0..inv.args().len() {
        total += inv.get::<i64>(index)?;
    }
    Ok(json!(total))
}

fn add(options: &TaskOptions) -> Thunk {
    let add = Task::with_options("add", options.clone(), sum_ints);
    let two = Task::with_options("two", options.clone(), |_| Ok(json!(2)));
    let three = Task::with_options("three", options.clone(), |_| Ok(json!(3)));
    add.call([three.thunk(), two.thunk()])
}

fn fan_out(n: usize, options: &TaskOptions) -> Thunk {
    let square = Task::with_options("square", options.clone(), |inv| {
        let x = inv.get::<i64>(0)?;
        let squared = x * x;
        match inv.shared_memory() {
            Some(shm) => {
                let mut segment = shm.create(std::mem::size_of::<i64>())?;
                segment.as_mut_slice().copy_from_slice(&squared.to_le_bytes());
                Ok(serde_json::to_value(segment.handle())?)
            }
            None => Ok(json!(squared)),
        }
    });
    let sum = Task::with_options("sum", options.clone(), |inv| {
        let mut total = 0i64;
        for (index, arg) in inv.args().iter().enumerate() {
            total += read_square(inv, index, arg)?;
        }
        Ok(json!(total))
    });
    sum.call((1..=n as i64).map(|x| square.call([json!(x)])))
}

/// A square arrives either inline or as a shared memory segment handle.
fn read_square(inv: &Invocation<'_>, index: usize, arg: &Value) -> anyhow::Result<i64> {
    if let Some(x) = arg.as_i64() {
        return Ok(x);
    }
    let handle: SegmentHandle = serde_json::from_value(arg.clone())
        .with_context(|| format!("argument {} is neither an integer nor a segment", index))?;
    let shm = inv
        .shared_memory()
        .ok_or_else(|| anyhow!("argument {} is a segment but shared memory is off", index))?;
    let segment = shm.attach(&handle)?;
    let bytes: [u8; 8] = segment.as_slice()[..8]
        .try_into()
        .context("segment shorter than 8 bytes")?;
    Ok(i64::from_le_bytes(bytes))
}

fn branch(input: &str, options: &TaskOptions) -> Thunk {
    let emit = Task::with_options("emit", options.clone(), |inv| {
        Ok(json!(format!("{}!", inv.get::<String>(0)?)))
    });
    let printx = Task::with_options("printx", options.clone(), |inv| {
        Ok(json!(format!("X: {}", inv.get::<String>(0)?)))
    });
    let printy = Task::with_options("printy", options.clone(), |inv| {
        Ok(json!(format!("Y: {}", inv.get::<String>(0)?)))
    });
    let flow = Task::with_options("flow", options.clone(), |inv| Ok(inv.arg(0)?.clone()));

    let route = Arg::select(emit.call([json!(input)]), move |emitted| {
        if emitted == "emit!" {
            printx.call([emitted.clone()]).into()
        } else {
            printy.call([emitted.clone()]).into()
        }
    });
    flow.call([route])
}

fn stall(stall_ms: u64, options: &TaskOptions) -> Thunk {
    let add = Task::with_options("add", options.clone(), sum_ints);
    let stall = Task::with_options("stall", options.clone(), |inv| {
        std::thread::sleep(Duration::from_millis(inv.get::<u64>(0)?));
        Ok(json!(0))
    });
    add.call([Arg::from(stall.call([json!(stall_ms)])), Arg::value(1)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use entangle::{ExecutorKind, Runtime, RuntimeConfig};

    fn thread_runtime() -> Runtime {
        Runtime::new(RuntimeConfig::new().with_executor(ExecutorKind::Thread))
    }

    #[test]
    fn test_add_graph_shape() {
        let thunk = build(&Scenario::Add, &TaskOptions::new());
        assert_eq!(thunk.name(), "add");
        assert_eq!(thunk.worker_count(), 2);
    }

    #[test]
    fn test_fan_out_counts_workers() {
        let thunk = build(&Scenario::FanOut { n: 5 }, &TaskOptions::new());
        assert_eq!(thunk.worker_count(), 5);
        assert!(!thunk.uses_shared_memory());
    }

    #[test]
    fn test_fan_out_on_threads() {
        let thunk = build(&Scenario::FanOut { n: 4 }, &TaskOptions::new());
        assert_eq!(thread_runtime().resolve(&thunk).unwrap(), json!(30));
    }

    #[test]
    fn test_fan_out_shared_memory_on_threads() {
        let options = TaskOptions::new().with_shared_memory(true);
        let thunk = build(&Scenario::FanOut { n: 4 }, &options);
        assert!(thunk.uses_shared_memory());
        assert_eq!(thread_runtime().resolve(&thunk).unwrap(), json!(30));
    }

    #[test]
    fn test_branch_routes_on_emitted_value() {
        let runtime = thread_runtime();
        let emit = build(
            &Scenario::Branch {
                input: "emit".into(),
            },
            &TaskOptions::new(),
        );
        assert_eq!(runtime.resolve(&emit).unwrap(), json!("X: emit!"));

        let hello = build(
            &Scenario::Branch {
                input: "HELLO".into(),
            },
            &TaskOptions::new(),
        );
        assert_eq!(runtime.resolve(&hello).unwrap(), json!("Y: HELLO!"));
    }
}
