//! Multi-task message exchanges through public ports.

use amigo_astructs::GuestStruct;
use amigo_exec::structs::{Message, MsgPort, NodeType, TaskState};
use amigo_exec::{
    promote, ExecConfig, ExecError, ExecLib, ExecResult, Promoted, Scheduler, TaskContext,
    TaskSpec,
};
use amigo_machine::{GuestMemory, Machine, MachineConfig};

/// A `Message` followed by one longword of payload.
const REQUEST_SIZE: u32 = 24;

fn exec() -> ExecLib {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let machine = Machine::new(&MachineConfig::default()).unwrap();
    ExecLib::new(machine, ExecConfig::default()).unwrap()
}

fn new_request<'e>(
    ctx: &TaskContext<'e>,
    reply: Option<MsgPort<'e>>,
    value: u32,
) -> ExecResult<Message<'e>> {
    let addr = ctx
        .exec()
        .allocator()
        .allocate(REQUEST_SIZE, "request")
        .ok_or(ExecError::OutOfMemory { what: "request" })?;
    let msg = Message::at(ctx.space(), addr);
    msg.view().clear()?;
    msg.node().init(NodeType::Message, 0)?;
    msg.init(reply)?;
    msg.set_length(REQUEST_SIZE as u16)?;
    ctx.space().mem().write_u32(addr + 20, value)?;
    Ok(msg)
}

fn payload(ctx: &TaskContext<'_>, msg: Message<'_>) -> ExecResult<u32> {
    Ok(ctx.space().mem().read_u32(msg.addr() + 20)?)
}

fn set_payload(ctx: &TaskContext<'_>, msg: Message<'_>, value: u32) -> ExecResult<()> {
    Ok(ctx.space().mem().write_u32(msg.addr() + 20, value)?)
}

/// Serves `count` requests on a public port named `name`, replying with the payload doubled.
fn serve(ctx: &TaskContext<'_>, name: &str, count: u32) -> ExecResult<u32> {
    let port = ctx.create_msg_port()?.ok_or(ExecError::OutOfMemory { what: "port" })?;
    port.node()
        .name_field()
        .alloc_str(ctx.exec().allocator(), name)?;
    ctx.add_port(port)?;

    let mut served = 0;
    while served < count {
        ctx.wait_port(port)?;
        while let Some(msg) = ctx.get_msg(port)? {
            let value = payload(ctx, msg)?;
            set_payload(ctx, msg, value * 2)?;
            ctx.reply_msg(msg)?;
            served += 1;
        }
    }

    ctx.rem_port(port)?;
    port.node().name_field().free_str(ctx.exec().allocator())?;
    ctx.delete_msg_port(port)?;
    Ok(served)
}

/// Sends `value` to the public port `name` and waits for the answer.
fn call(ctx: &TaskContext<'_>, name: &str, value: u32) -> ExecResult<u32> {
    let server = ctx.find_port(name)?.expect("server port is public");
    let reply = ctx.create_msg_port()?.ok_or(ExecError::OutOfMemory { what: "port" })?;
    let msg = new_request(ctx, Some(reply), value)?;
    ctx.put_msg(server, msg)?;

    let answered = ctx.wait_port(reply)?;
    assert_eq!(answered, Some(msg));
    let got = ctx.get_msg(reply)?;
    assert_eq!(got, Some(msg));
    assert_eq!(msg.kind()?, Some(NodeType::ReplyMsg));

    let result = payload(ctx, msg)?;
    ctx.exec().allocator().free(msg.addr());
    ctx.delete_msg_port(reply)?;
    Ok(result)
}

#[test]
fn server_doubles_each_request() {
    let exec = exec();
    let blocks = exec.machine().alloc.live_blocks();

    let results = Scheduler::new(&exec).run(vec![
        TaskSpec::new("doubler", |ctx| serve(ctx, "doubler", 2)).with_priority(5),
        TaskSpec::new("client-a", |ctx| call(ctx, "doubler", 21)),
        TaskSpec::new("client-b", |ctx| call(ctx, "doubler", 100)),
    ]);

    assert_eq!(results, [Ok(2), Ok(42), Ok(200)]);
    assert_eq!(exec.machine().alloc.live_blocks(), blocks);
    assert!(exec.port_list().is_empty().unwrap());
    assert!(exec.task_ready().is_empty().unwrap());
    assert!(exec.task_wait().is_empty().unwrap());
}

#[test]
fn lower_priority_server_still_answers() {
    let exec = exec();

    // The client runs first, so it waits for the server to announce its port.
    let results = Scheduler::new(&exec).run(vec![
        TaskSpec::new("client", |ctx| {
            let ready = ctx.alloc_signal(20)?;
            ctx.wait(1u32 << ready)?;
            call(ctx, "late", 7)
        })
        .with_priority(10),
        TaskSpec::new("late", |ctx| {
            let port = ctx.create_msg_port()?.ok_or(ExecError::OutOfMemory { what: "port" })?;
            port.node().name_field().alloc_str(ctx.exec().allocator(), "late")?;
            ctx.add_port(port)?;

            let client = ctx.find_task(Some("client"))?.expect("client is running");
            ctx.signal(client, 1 << 20)?;

            let msg = ctx.wait_port(port)?.expect("request queued");
            ctx.get_msg(port)?;
            let value = payload(ctx, msg)?;
            set_payload(ctx, msg, value + 1)?;
            ctx.reply_msg(msg)?;

            ctx.rem_port(port)?;
            port.node().name_field().free_str(ctx.exec().allocator())?;
            ctx.delete_msg_port(port)?;
            Ok(value)
        }),
    ]);

    assert_eq!(results, [Ok(8), Ok(7)]);
}

#[test]
fn packets_reach_a_process_port() {
    let exec = exec();

    let results = Scheduler::new(&exec).run(vec![
        TaskSpec::process("handler", |ctx| {
            let me = ctx.current_task().expect("scheduled");
            let Ok(Promoted::Process(process)) = promote(me.node()) else {
                panic!("handler is not a process");
            };
            let port = process.msg_port();
            assert_eq!(port.sig_task().get()?, Some(me));

            let packet = ctx.wait_port(port)?.expect("packet queued");
            ctx.get_msg(port)?;
            let value = payload(ctx, packet)?;
            ctx.reply_msg(packet)?;
            Ok(value)
        })
        .with_priority(1),
        TaskSpec::new("sender", |ctx| {
            let handler = ctx.find_task(Some("handler"))?.expect("handler is running");
            assert_eq!(handler.state()?, Some(TaskState::Wait));
            let Ok(Promoted::Process(process)) = promote(handler.node()) else {
                panic!("handler is not a process");
            };

            let reply = ctx.create_msg_port()?.ok_or(ExecError::OutOfMemory { what: "port" })?;
            let packet = new_request(ctx, Some(reply), 0xD05)?;
            ctx.put_msg(process.msg_port(), packet)?;
            assert_eq!(handler.state()?, Some(TaskState::Ready));

            ctx.wait_port(reply)?;
            ctx.get_msg(reply)?;
            ctx.exec().allocator().free(packet.addr());
            ctx.delete_msg_port(reply)?;
            Ok(0)
        }),
    ]);

    assert_eq!(results, [Ok(0xD05), Ok(0)]);
}

#[test]
fn client_without_server_deadlocks_cleanly() {
    let exec = exec();
    let blocks = exec.machine().alloc.live_blocks();

    let results = Scheduler::new(&exec).run(vec![TaskSpec::new("lonely", |ctx| {
        let port = ctx.create_msg_port()?.ok_or(ExecError::OutOfMemory { what: "port" })?;
        let outcome = ctx.wait_port(port);
        ctx.delete_msg_port(port)?;
        outcome.map(|_| 0)
    })]);

    assert_eq!(
        results,
        [Err(ExecError::Deadlock {
            task: "lonely".to_owned()
        })]
    );
    assert_eq!(exec.machine().alloc.live_blocks(), blocks);
}
