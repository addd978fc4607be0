//! Conveyor/airflow MCU driver
//!
//! Protocol Overview:
//! - ASCII commands terminated by `\r\n`, no response required
//! - Motor speed: `A<v>` / `B<v>`, v = round(percent * 255 / 100)
//! - Motor direction: `AD<c>` / `BD<c>`, c = 0 stop, 1 forward, 2 reverse
//! - Fan (airflow gate): `F<percent>`, percent clamped to 0-100
//!
//! The driver is generic over any async byte stream, so tests can run it over
//! an in-memory duplex pipe. With the `tokio_serial` feature, `McuActuator::open`
//! opens the configured serial port at 8N1.

use crate::config::HardwareConfig;
use crate::hardware::capabilities::{ActuatorPort, ConveyorMove, PortError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Motor channel on the MCU board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Motor {
    A,
    B,
}

impl Motor {
    fn speed_prefix(self) -> &'static str {
        match self {
            Motor::A => "A",
            Motor::B => "B",
        }
    }

    fn direction_prefix(self) -> &'static str {
        match self {
            Motor::A => "AD",
            Motor::B => "BD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Stop,
    Forward,
    Reverse,
}

impl Direction {
    fn code(self) -> u8 {
        match self {
            Direction::Stop => 0,
            Direction::Forward => 1,
            Direction::Reverse => 2,
        }
    }
}

#[must_use]
pub fn speed_command(motor: Motor, percent: u8) -> String {
    let hw_value = (f64::from(percent.min(100)) * 255.0 / 100.0).round() as u8;
    format!("{}{}", motor.speed_prefix(), hw_value)
}

#[must_use]
pub fn direction_command(motor: Motor, direction: Direction) -> String {
    format!("{}{}", motor.direction_prefix(), direction.code())
}

#[must_use]
pub fn fan_command(percent: u8) -> String {
    format!("F{}", percent.min(100))
}

/// Actuator backed by the MCU command protocol.
pub struct McuActuator<W> {
    port: Mutex<W>,
    line_ending: &'static str,
    conveyor_motor: Motor,
    speed_percent: u8,
    mm_per_sec: f64,
}

impl<W> McuActuator<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(port: W, config: &HardwareConfig) -> Self {
        Self {
            port: Mutex::new(port),
            line_ending: "\r\n",
            conveyor_motor: Motor::A,
            speed_percent: config.conveyor_speed_percent,
            mm_per_sec: config.conveyor_mm_per_sec,
        }
    }

    /// Drive the conveyor from motor `B` instead of `A`.
    #[must_use]
    pub fn with_conveyor_motor(mut self, motor: Motor) -> Self {
        self.conveyor_motor = motor;
        self
    }

    /// Write one command line.
    pub async fn send(&self, command: &str) -> Result<(), PortError> {
        let mut port = self.port.lock().await;
        let line = format!("{command}{}", self.line_ending);
        port.write_all(line.as_bytes())
            .await
            .map_err(|e| PortError::Failed(format!("write '{command}': {e}")))?;
        port.flush()
            .await
            .map_err(|e| PortError::Failed(format!("flush '{command}': {e}")))?;
        debug!(command, "MCU command sent");
        Ok(())
    }

    pub async fn set_motor_speed(&self, motor: Motor, percent: u8) -> Result<(), PortError> {
        self.send(&speed_command(motor, percent)).await
    }

    pub async fn set_motor_direction(
        &self,
        motor: Motor,
        direction: Direction,
    ) -> Result<(), PortError> {
        self.send(&direction_command(motor, direction)).await
    }

    pub async fn set_fan_speed(&self, percent: u8) -> Result<(), PortError> {
        self.send(&fan_command(percent)).await
    }

    fn run_time(&self, movement: ConveyorMove) -> Result<(Duration, Direction), PortError> {
        match movement {
            ConveyorMove::Duration(duration) => Ok((duration, Direction::Forward)),
            ConveyorMove::Distance(mm) => {
                if self.mm_per_sec <= 0.0 || !mm.is_finite() {
                    return Err(PortError::Failed(format!(
                        "cannot convert {mm} mm at {} mm/s",
                        self.mm_per_sec
                    )));
                }
                let direction = if mm < 0.0 {
                    Direction::Reverse
                } else {
                    Direction::Forward
                };
                Ok((Duration::from_secs_f64(mm.abs() / self.mm_per_sec), direction))
            }
        }
    }
}

#[cfg(feature = "tokio_serial")]
impl McuActuator<tokio_serial::SerialStream> {
    /// Open the MCU serial port from configuration.
    pub fn open(config: &HardwareConfig) -> anyhow::Result<Self> {
        use anyhow::Context;
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(&config.mcu_port, config.mcu_baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| {
                format!(
                    "Failed to open MCU port '{}' at {} baud",
                    config.mcu_port, config.mcu_baud_rate
                )
            })?;
        Ok(Self::new(port, config))
    }
}

#[async_trait]
impl<W> ActuatorPort for McuActuator<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn move_conveyor(&self, movement: ConveyorMove) -> Result<(), PortError> {
        let (run_time, direction) = self.run_time(movement)?;
        let motor = self.conveyor_motor;

        self.set_motor_speed(motor, self.speed_percent).await?;
        self.set_motor_direction(motor, direction).await?;
        tokio::time::sleep(run_time).await;
        self.set_motor_direction(motor, Direction::Stop).await
    }

    async fn set_airflow_gate(&self, level: u8) -> Result<(), PortError> {
        if level > 100 {
            return Err(PortError::Failed(format!(
                "airflow level {level} out of range"
            )));
        }
        self.set_fan_speed(level).await
    }
}
