//! Stock tasks shipped with the `hostrun` binary

use crate::error::Result;
use crate::executors::shell_quote;
use crate::models::{CommandResult, TaskValue};
use crate::registry::{BoundArgs, Param, TaskDef, TaskFuture, TaskRegistry};
use crate::scope::TaskScope;

/// Register every stock task
pub fn register_builtin(registry: &mut TaskRegistry) -> Result<()> {
    registry.register(
        TaskDef::from_fn("hello", hello)
            .describe("Print a greeting")
            .param(Param::required("name"))
            .param(Param::required("surname"))
            .param(Param::optional("treat", "Sr")),
    )?;
    registry.register(
        TaskDef::from_fn("local_script", local_script)
            .describe("Run a script on this machine")
            .param(Param::optional("script", "./test.py"))
            .param(Param::optional("interpreter", "python")),
    )?;
    registry.register(TaskDef::from_fn("uname", uname).describe("Print kernel information"))?;
    registry.register(
        TaskDef::from_fn("deploy_script", deploy_script)
            .describe("Upload a script and run it on the host")
            .param(Param::optional("script", "test.py"))
            .param(Param::optional("folder", "."))
            .param(Param::optional("interpreter", "python")),
    )?;
    registry.register(
        TaskDef::from_fn("shell", shell)
            .describe("Run an arbitrary command")
            .param(Param::required("command")),
    )?;
    Ok(())
}

fn hello<'a>(scope: &'a mut TaskScope, args: &'a BoundArgs) -> TaskFuture<'a> {
    Box::pin(async move {
        scope.echo(&format!(
            "Hello {} {} {}",
            args.value("treat")?,
            args.value("name")?,
            args.value("surname")?
        ));
        Ok(TaskValue::Done)
    })
}

fn local_script<'a>(scope: &'a mut TaskScope, args: &'a BoundArgs) -> TaskFuture<'a> {
    Box::pin(async move {
        let command = format!(
            "{} {}",
            args.value("interpreter")?,
            shell_quote(args.value("script")?)
        );
        let result = scope.local(&command).await?;
        echo_output(scope, &result);
        Ok(result.into())
    })
}

fn uname<'a>(scope: &'a mut TaskScope, _args: &'a BoundArgs) -> TaskFuture<'a> {
    Box::pin(async move {
        let result = scope.run("uname -a").await?;
        echo_output(scope, &result);
        Ok(result.into())
    })
}

fn deploy_script<'a>(scope: &'a mut TaskScope, args: &'a BoundArgs) -> TaskFuture<'a> {
    Box::pin(async move {
        let uploaded = scope
            .put(args.value("script")?, args.value("folder")?)
            .await?;

        let command = format!(
            "{} {}",
            args.value("interpreter")?,
            shell_quote(&uploaded.remote_path)
        );
        let result = scope.run(&command).await?;
        echo_output(scope, &result);
        Ok(result.into())
    })
}

fn shell<'a>(scope: &'a mut TaskScope, args: &'a BoundArgs) -> TaskFuture<'a> {
    Box::pin(async move {
        let result = scope.run(args.value("command")?).await?;
        echo_output(scope, &result);
        Ok(result.into())
    })
}

fn echo_output(scope: &TaskScope, result: &CommandResult) {
    for line in result.stdout.lines() {
        scope.echo(&format!("out: {}", line));
    }
    for line in result.stderr.lines() {
        scope.echo(&format!("err: {}", line));
    }
}
