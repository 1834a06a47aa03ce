//! Interpreter-side driver program.
//!
//! The runner launches `python3 -c <HARNESS>` for each block.  The harness
//! speaks a line-oriented JSON protocol on the child's real stdin/stdout:
//!
//! 1. It reads a single request line `{"code", "env", "persistent_state"}`.
//! 2. While the block runs it may emit `{"rpc": <method>, "params": {...}}`
//!    lines for host-mediated operations (`install_packages`, `get_env`,
//!    `display`, `input`, `get_code_by_id`); each is answered by one
//!    `{"value": ...}` line.
//! 3. It terminates with exactly one `{"done": {...}}` line carrying the
//!    captured streams, the result bag, error info, and the final persistent
//!    state.
//!
//! User code's own stdout/stderr are redirected into in-memory buffers
//! before `exec`, so protocol lines never interleave with user output.
//! Values that cannot be represented as JSON are replaced with the
//! `<filtered>` sentinels before they reach the host.

/// The Python source executed via `python3 -c`.
pub const PY_HARNESS: &str = r#"
import io
import json
import os
import random
import re
import sys
import time
import traceback

_stdin = sys.stdin
_protocol = sys.stdout

_request = json.loads(_stdin.readline())
_envs = dict(_request.get('env') or {})

__result__ = {}
__storage__ = dict(_request.get('persistent_state') or {})


def set_result(**kwargs):
    __result__.update(kwargs)


def set_persistent_state(**kwargs):
    __storage__.update(kwargs)


def get_persistent_state(key):
    return __storage__.get(key)


def _call(method, **params):
    _protocol.write(json.dumps({'rpc': method, 'params': params}, ensure_ascii=False, default=str) + '\n')
    _protocol.flush()
    reply = json.loads(_stdin.readline())
    return reply.get('value')


class _Runtime:
    def install_packages(self, *names):
        return bool(_call('install_packages', names=list(names)))

    def get_env(self, name, default=None, desc=None):
        value = _envs.get(name)
        if value is None:
            value = _call('get_env', name=name, default=default, desc=desc)
            if value:
                _envs[name] = value
        return value if value else default

    def display(self, path=None, url=None):
        _call('display', path=path, url=url)

    def get_code_by_id(self, code_id):
        return _call('get_code_by_id', id=code_id)


runtime = _Runtime()


def input(prompt=''):
    return _call('input', prompt=prompt) or ''


def _json_safe(value):
    try:
        json.dumps(value, ensure_ascii=False, default=str)
        return True
    except (TypeError, OverflowError, ValueError):
        return False


def _clean(value):
    if isinstance(value, dict):
        return dict((k, _clean(v)) for k, v in value.items())
    if isinstance(value, list):
        return [_clean(v) for v in value]
    return value if _json_safe(value) else '<filtered>'


_captured_out = io.StringIO()
_captured_err = io.StringIO()
sys.stdout = _captured_out
sys.stderr = _captured_err

_report = {}
_globals = {
    '__name__': '__main__',
    'os': os,
    're': re,
    'sys': sys,
    'json': json,
    'time': time,
    'random': random,
    'traceback': traceback,
    'runtime': runtime,
    'input': input,
    'set_result': set_result,
    'set_persistent_state': set_persistent_state,
    'get_persistent_state': get_persistent_state,
}

try:
    exec(_request['code'], _globals)
except (SystemExit, Exception) as exc:
    _report['errstr'] = str(exc)
    _report['traceback'] = traceback.format_exc()
finally:
    sys.stdout = sys.__stdout__
    sys.stderr = sys.__stderr__

_text = _captured_out.getvalue().strip()
if _text:
    _report['stdout'] = _text if _json_safe(_text) else '<filtered: cannot json-serialize>'
_text = _captured_err.getvalue().strip()
if _text:
    _report['stderr'] = _text if _json_safe(_text) else '<filtered: cannot json-serialize>'
if __result__:
    _report['result'] = _clean(__result__)
_report['persistent_state'] = _clean(__storage__)

_protocol.write(json.dumps({'done': _report}, ensure_ascii=False, default=str) + '\n')
_protocol.flush()
"#;
