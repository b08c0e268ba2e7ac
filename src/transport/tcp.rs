use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_modbus::{prelude::*, Quantity};
use tokio_modbus::server::tcp::Server;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::stream::ManagedStream;
use super::Transport;
use crate::slave::{Access, RequestHandler};

/// Modbus/TCP listener in front of a [`RequestHandler`].
pub struct TcpTransport<H> {
    bind_address: String,
    max_clients: usize,
    idle_timeout: Duration,
    handler: Arc<H>,
    connections: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: RequestHandler> TcpTransport<H> {
    pub fn new(
        bind_address: impl Into<String>,
        max_clients: usize,
        idle_timeout: Duration,
        handler: H,
    ) -> Self {
        Self {
            bind_address: bind_address.into(),
            max_clients,
            idle_timeout,
            handler: Arc::new(handler),
            connections: CancellationToken::new(),
            server: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// The bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

impl<H: RequestHandler> Transport for TcpTransport<H> {
    async fn start(&self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, max_clients = self.max_clients, "Modbus TCP listener bound");

        let server = Server::new(listener);
        let handler = Arc::clone(&self.handler);
        let permits = Arc::new(Semaphore::new(self.max_clients));
        let idle_timeout = self.idle_timeout;
        let connections = self.connections.clone();

        let task = tokio::spawn(async move {
            let on_connected = move |stream: TcpStream, peer: SocketAddr| {
                let handler = Arc::clone(&handler);
                let permits = Arc::clone(&permits);
                let shutdown = connections.child_token();
                async move {
                    let Ok(permit) = permits.try_acquire_owned() else {
                        warn!(%peer, "Client limit reached, refusing connection");
                        return Ok(None);
                    };
                    debug!(%peer, "Client connected");
                    let service = SlaveService {
                        handler,
                        peer,
                        _permit: permit,
                    };
                    let stream = ManagedStream::new(stream, idle_timeout, shutdown);
                    io::Result::Ok(Some((service, stream)))
                }
            };
            let on_process_error = |err: io::Error| {
                warn!(error = %err, "Client connection closed with error");
            };

            if let Err(err) = server.serve(&on_connected, on_process_error).await {
                error!(error = %err, "Modbus TCP server stopped");
            }
        });

        *self.local_addr.lock() = Some(local_addr);
        if let Some(previous) = self.server.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop(&self) {
        self.connections.cancel();
        let task = self.server.lock().take();
        if let Some(task) = task {
            task.abort();
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    error!(error = %err, "Modbus TCP server task failed");
                }
            }
            info!("Modbus TCP listener stopped");
        }
    }
}

/// One connected client. Holds a connection slot until dropped.
struct SlaveService<H> {
    handler: Arc<H>,
    peer: SocketAddr,
    _permit: OwnedSemaphorePermit,
}

impl<H> Drop for SlaveService<H> {
    fn drop(&mut self) {
        debug!(peer = %self.peer, "Client disconnected");
    }
}

impl<H: RequestHandler> tokio_modbus::server::Service for SlaveService<H> {
    type Request = SlaveRequest<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        future::ready(dispatch(self.handler.as_ref(), req))
    }
}

/// Maps a decoded Modbus request onto the handler's per-table entry points.
fn dispatch<H: RequestHandler + ?Sized>(
    handler: &H,
    req: SlaveRequest<'_>,
) -> Result<Response, ExceptionCode> {
    let SlaveRequest { slave, request } = req;

    let res = match request {
        Request::ReadCoils(addr, quantity) => handler
            .coils(slave, Access::Read { addr, quantity })
            .map(Response::ReadCoils),
        Request::WriteSingleCoil(addr, coil) => handler
            .coils(slave, Access::Write { addr, values: &[coil] })
            .map(|_| Response::WriteSingleCoil(addr, coil)),
        Request::WriteMultipleCoils(addr, coils) => {
            let quantity = count(&coils)?;
            handler
                .coils(slave, Access::Write { addr, values: &coils })
                .map(|_| Response::WriteMultipleCoils(addr, quantity))
        }
        Request::ReadDiscreteInputs(addr, quantity) => handler
            .discrete_inputs(slave, addr, quantity)
            .map(Response::ReadDiscreteInputs),
        Request::ReadInputRegisters(addr, quantity) => handler
            .input_registers(slave, addr, quantity)
            .map(Response::ReadInputRegisters),
        Request::ReadHoldingRegisters(addr, quantity) => handler
            .holding_registers(slave, Access::Read { addr, quantity })
            .map(Response::ReadHoldingRegisters),
        Request::WriteSingleRegister(addr, word) => handler
            .holding_registers(slave, Access::Write { addr, values: &[word] })
            .map(|_| Response::WriteSingleRegister(addr, word)),
        Request::WriteMultipleRegisters(addr, words) => {
            let quantity = count(&words)?;
            handler
                .holding_registers(slave, Access::Write { addr, values: &words })
                .map(|_| Response::WriteMultipleRegisters(addr, quantity))
        }
        // The write happens before the read.
        Request::ReadWriteMultipleRegisters(read_addr, read_quantity, write_addr, words) => handler
            .holding_registers(slave, Access::Write { addr: write_addr, values: &words })
            .and_then(|_| {
                handler.holding_registers(
                    slave,
                    Access::Read {
                        addr: read_addr,
                        quantity: read_quantity,
                    },
                )
            })
            .map(Response::ReadWriteMultipleRegisters),
        other => {
            debug!(unit_id = slave, request = ?other, "Unsupported function");
            return Err(ExceptionCode::IllegalFunction);
        }
    };

    res.map_err(|err| err.exception_code())
}

fn count<T>(values: &[T]) -> Result<Quantity, ExceptionCode> {
    Quantity::try_from(values.len()).map_err(|_| ExceptionCode::IllegalDataValue)
}

#[cfg(test)]
mod tests {
    use tokio_modbus::client::Context;

    use super::*;
    use crate::config::ModbusConfig;
    use crate::slave::{Dispatcher, RegisterStore};

    fn dispatcher() -> Dispatcher {
        let config = ModbusConfig {
            unit_id: 1,
            max_registers: 200,
            counter_address: 10,
            update_interval: 1,
            initial_data: vec![],
        };
        Dispatcher::new(Arc::new(RegisterStore::new(&config).unwrap()))
    }

    async fn started(max_clients: usize) -> (TcpTransport<Dispatcher>, SocketAddr) {
        let transport =
            TcpTransport::new("127.0.0.1:0", max_clients, Duration::from_secs(30), dispatcher());
        transport.start().await.unwrap();
        let addr = transport.local_addr().unwrap();
        (transport, addr)
    }

    #[test]
    fn unsupported_function_is_illegal() {
        let d = dispatcher();
        let req = SlaveRequest {
            slave: 1,
            request: Request::MaskWriteRegister(0, 0xFF00, 0x0012),
        };
        assert_eq!(dispatch(&d, req).unwrap_err(), ExceptionCode::IllegalFunction);
    }

    #[test]
    fn read_write_multiple_writes_first() {
        let d = dispatcher();
        let req = SlaveRequest {
            slave: 1,
            request: Request::ReadWriteMultipleRegisters(4, 3, 5, vec![11, 12].into()),
        };
        let res = dispatch(&d, req).unwrap();
        assert_eq!(res, Response::ReadWriteMultipleRegisters(vec![0, 11, 12]));
    }

    #[test]
    fn single_register_write_echoes_request() {
        let d = dispatcher();
        let req = SlaveRequest {
            slave: 1,
            request: Request::WriteSingleRegister(10, 999),
        };
        assert_eq!(dispatch(&d, req).unwrap(), Response::WriteSingleRegister(10, 999));
        assert_eq!(d.store().read_holding(1, 10, 1).unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn serves_modbus_clients() {
        let (transport, addr) = started(4).await;

        let mut ctx: Context = tcp::connect_slave(addr, Slave(1)).await.unwrap();
        ctx.write_single_register(5, 12345).await.unwrap().unwrap();
        let regs = ctx.read_holding_registers(5, 1).await.unwrap().unwrap();
        assert_eq!(regs, vec![12345]);

        ctx.write_multiple_coils(0, &[true, false, true]).await.unwrap().unwrap();
        let coils = ctx.read_coils(0, 3).await.unwrap().unwrap();
        assert_eq!(coils, vec![true, false, true]);

        let overrun = ctx.read_holding_registers(199, 5).await.unwrap();
        assert_eq!(overrun, Err(ExceptionCode::IllegalDataAddress));

        ctx.set_slave(Slave(99));
        let wrong_unit = ctx.read_input_registers(0, 1).await.unwrap();
        assert_eq!(wrong_unit, Err(ExceptionCode::IllegalFunction));

        transport.stop().await;
    }

    #[tokio::test]
    async fn client_limit_refuses_extra_clients_until_one_leaves() {
        let (transport, addr) = started(1).await;

        // A served request means the first client holds the only slot.
        let mut first: Context = tcp::connect_slave(addr, Slave(1)).await.unwrap();
        first.read_holding_registers(0, 1).await.unwrap().unwrap();

        let refused = match tcp::connect_slave(addr, Slave(1)).await {
            Ok(mut second) => second.read_holding_registers(0, 1).await.is_err(),
            Err(_) => true,
        };
        assert!(refused, "second client was served past the limit");

        drop(first);

        let mut served = false;
        for _ in 0..50 {
            if let Ok(mut ctx) = tcp::connect_slave(addr, Slave(1)).await {
                if let Ok(Ok(regs)) = ctx.read_holding_registers(0, 1).await {
                    assert_eq!(regs, vec![0]);
                    served = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(served, "slot was not released after the first client left");

        transport.stop().await;
    }

    #[tokio::test]
    async fn second_bind_on_same_port_fails() {
        let (first, addr) = started(1).await;
        let second =
            TcpTransport::new(addr.to_string(), 1, Duration::from_secs(30), dispatcher());
        assert!(second.start().await.is_err());
        first.stop().await;
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let transport =
            TcpTransport::new("127.0.0.1:0", 1, Duration::from_secs(30), dispatcher());
        transport.stop().await;
        assert!(transport.local_addr().is_none());
    }
}
