mod cucumber;

use ::cucumber::{codegen::LocalBoxFuture, event::ScenarioFinished, gherkin, writer, World};
use futures::FutureExt;
use log::*;
use tokio::runtime::Runtime;

use crate::cucumber::CheckoutWorld;

fn main() {
    dotenvy::from_filename(".env.test").ok();
    env_logger::init();
    let sys = Runtime::new().expect("Could not start the test runtime");
    sys.block_on(
        CheckoutWorld::cucumber()
            .with_writer(writer::Libtest::or_basic())
            .after(|_f, _r, scenario, ev, w| post_test_hook(scenario, ev, w))
            .run("tests/features"),
    );
    info!("🚀️ Tests complete");
}

fn post_test_hook<'a>(
    scenario: &'a gherkin::Scenario,
    ev: &'a ScenarioFinished,
    world: Option<&'a mut CheckoutWorld>,
) -> LocalBoxFuture<'a, ()> {
    let fut = async move {
        trace!("🚀️ After-scenario hook running for \"{}\"", scenario.name);
        match (ev, world) {
            (ScenarioFinished::StepFailed(_, _, _), Some(world)) => {
                error!("🚀️ Scenario failed. Writes seen by the store: {:#?}", world.store.writes());
            },
            (ScenarioFinished::StepPassed, Some(world)) => {
                let open = world.registry.active_count();
                if open > 0 {
                    warn!("🚀️ Scenario finished with {open} orders still reserved");
                }
            },
            _ => trace!("🚀️ Unhandled event: {ev:?}"),
        }
        trace!("🚀️ After-scenario hook complete");
    };
    fut.boxed_local()
}
