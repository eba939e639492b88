//! Fan out a long argument list over several xargs(1) children and fold
//! their parsed outputs back together.

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::harness::{FdAction, Harness};

/// Spawn `concurrency` copies of `xargs -r -0 cmd…`, feed them `args` round
/// robin (NUL-terminated), parse each child's stdout with `parse`, and
/// merge the partial results with `combine`. `combine` has to be
/// commutative: the children finish in whatever order they like.
pub async fn xargs_fold<T, P, C, I>(
    cmd: &[String],
    args: I,
    parse: P,
    combine: C,
    concurrency: usize,
) -> Result<T>
where
    T: Default + Send + 'static,
    P: Fn(&str) -> Result<T> + Clone + Send + Sync + 'static,
    C: Fn(&mut T, T),
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let concurrency = concurrency.max(1);
    let mut argv: Vec<String> = vec!["-r".into(), "-0".into()];
    argv.extend(cmd.iter().cloned());

    let mut stdins = Vec::with_capacity(concurrency);
    let mut readers = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        let mut child = Harness::cmd("xargs")
            .args(argv.iter().cloned())
            .stdin(FdAction::Pipe)
            .spawn()?;
        let mut stdout = child.take_stdout().context("xargs stdout is piped")?;
        stdins.push(child.take_stdin());
        let parse = parse.clone();
        // Readers drain concurrently while we are still feeding stdins;
        // anything else can deadlock on full pipes.
        readers.push((
            tokio::spawn(async move {
                use tokio::io::AsyncReadExt;
                let mut buf = Vec::new();
                stdout.read_to_end(&mut buf).await?;
                parse(&String::from_utf8_lossy(&buf))
            }),
            child,
        ));
    }

    let mut next_child = 0;
    for arg in args {
        if let Some(stdin) = stdins[next_child].as_mut() {
            stdin.write_all(arg.as_ref().as_bytes()).await?;
            stdin.write_all(b"\0").await?;
        }
        next_child = (next_child + 1) % concurrency;
    }
    drop(stdins);

    let (handles, children): (Vec<_>, Vec<_>) = readers.into_iter().unzip();
    let partials = futures::future::try_join_all(handles)
        .await
        .context("xargs parser task panicked")?;

    let mut folded = T::default();
    for partial in partials {
        combine(&mut folded, partial?);
    }
    for mut child in children {
        child.wait_success().await?;
    }
    Ok(folded)
}
